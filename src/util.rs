//! Small shared helpers: time, hashing, and safe text truncation.

use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as UNIX seconds.
///
/// Persisted records use float seconds throughout so TTL arithmetic stays
/// cheap on the hot path.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hex-encoded SHA-1 of the input.
pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Whitespace-normalized, lowercased SHA-1 fingerprint of advisory text.
///
/// Used for text-repeat detection. Two advisories differing only in
/// whitespace or case collide; punctuation differences do not.
pub fn text_fingerprint(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if normalized.is_empty() {
        return String::new();
    }
    sha1_hex(&normalized)[..16].to_string()
}

/// Safely truncate a string at a character boundary, adding an ellipsis.
///
/// Naive byte slicing (`&s[..n]`) panics inside multi-byte UTF-8
/// characters; this counts characters instead.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Truncate to a hard character budget, breaking on a word boundary.
///
/// Unlike [`truncate_chars`] the ellipsis fits *inside* the budget.
pub fn truncate_on_word_boundary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let budget = max_chars.saturating_sub(1);
    let head: String = s.chars().take(budget).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > budget / 2 => &head[..idx],
        _ => head.as_str(),
    };
    format!("{}…", cut.trim_end())
}

/// Clamp a token to a bounded non-empty identifier.
pub fn sanitize_token(value: &str, default: &str) -> String {
    let text = value.trim();
    if text.is_empty() {
        return default.to_string();
    }
    text.chars().take(120).collect()
}

/// Case-insensitive keyword-overlap count between two texts.
///
/// Tokens shorter than 4 characters are ignored; this is deliberately
/// crude — it only needs to separate "relevant" from "unrelated".
pub fn keyword_overlap(intent_text: &str, row_text: &str) -> usize {
    if intent_text.trim().is_empty() || row_text.trim().is_empty() {
        return 0;
    }
    let row_lower = row_text.to_lowercase();
    intent_text
        .to_lowercase()
        .split_whitespace()
        .filter(|tok| tok.len() >= 4)
        .filter(|tok| row_lower.contains(*tok))
        .count()
}
