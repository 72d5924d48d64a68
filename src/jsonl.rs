//! Bounded JSONL and atomic JSON file helpers.
//!
//! Every persistent surface of the engine is either a JSON document written
//! with temp-file + rename, or an append-only JSONL log with a line cap.
//! Readers tolerate torn tails by skipping unparseable lines.

use crate::error::Result;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Read a JSON document, returning `None` on absence or corruption.
pub fn read_json_file(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), "unparseable JSON treated as absent: {e}");
            None
        }
    }
}

/// Atomically write a JSON document (temp file + rename).
pub fn atomic_write_json(path: &Path, payload: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(serde_json::to_string_pretty(payload)?.as_bytes())?;
    file.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one JSON line, then rotate when the file exceeds `max_lines`.
pub fn append_jsonl_capped(path: &Path, entry: &Value, max_lines: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    rotate_jsonl(path, max_lines)
}

/// Keep only the last `max_lines` lines of a JSONL file.
pub fn rotate_jsonl(path: &Path, max_lines: usize) -> Result<()> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(()),
    };
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() <= max_lines {
        return Ok(());
    }
    let keep = &lines[lines.len() - max_lines..];
    fs::write(path, format!("{}\n", keep.join("\n")))?;
    Ok(())
}

/// Read the last `limit` parseable object rows of a JSONL file.
pub fn tail_jsonl(path: &Path, limit: usize) -> Vec<Value> {
    if limit == 0 {
        return Vec::new();
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..]
        .iter()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(|v| v.is_object())
        })
        .collect()
}

/// Read every parseable object row of a JSONL file.
pub fn read_jsonl(path: &Path) -> Vec<Value> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    raw.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(|v| v.is_object())
        })
        .collect()
}
