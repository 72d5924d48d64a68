//! Advisory emitter: the bridge between the engine and the host.
//!
//! Hook stdout is visible to the host model as context, so every word must
//! earn its place. The emitter selects the highest authority present,
//! formats accordingly, enforces a hard character budget, writes to the
//! sink, and appends a structured record to the emission log.

use crate::jsonl::append_jsonl_capped;
use crate::types::{Advice, Authority, GateResult, TaskPhase};
use crate::util::{now_ts, truncate_chars, truncate_on_word_boundary};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Hard character budget for any emitted advisory.
pub const MAX_EMIT_CHARS: usize = 500;

/// Whisper-formatted advisories are shorter still.
const WHISPER_MAX_CHARS: usize = 150;

const EMIT_LOG_MAX_LINES: usize = 300;

/// Where emitted text goes. Non-stdout hosts (IDE plugins, in-process
/// assistants) substitute their own sink.
pub trait AdvisorySink: Send {
    fn write_line(&mut self, text: &str) -> std::io::Result<()>;
}

/// Default sink: the host's stdout channel, flushed per line.
pub struct StdoutSink;

impl AdvisorySink for StdoutSink {
    fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}")?;
        stdout.flush()
    }
}

/// In-memory sink for tests and embedded hosts.
#[derive(Default)]
pub struct BufferSink {
    pub lines: Vec<String>,
}

impl AdvisorySink for BufferSink {
    fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        self.lines.push(text.to_string());
        Ok(())
    }
}

/// Context recorded alongside an emission.
#[derive(Debug, Clone, Default)]
pub struct EmitMeta {
    pub phase: Option<TaskPhase>,
    pub route: String,
    pub trace_id: Option<String>,
    pub tool_name: Option<String>,
}

/// Formats and writes advisories, one per hook at most.
pub struct Emitter {
    pub enabled: bool,
    log_path: PathBuf,
    sink: Mutex<Box<dyn AdvisorySink>>,
}

impl Emitter {
    pub fn new(home: &crate::home::SparkHome) -> Self {
        Self {
            enabled: true,
            log_path: home.emit_log(),
            sink: Mutex::new(Box::new(StdoutSink)),
        }
    }

    pub fn with_sink(home: &crate::home::SparkHome, sink: Box<dyn AdvisorySink>) -> Self {
        Self { enabled: true, log_path: home.emit_log(), sink: Mutex::new(sink) }
    }

    /// Emit an advisory for the given gate result. Returns the final text
    /// written to the sink, or `None` when nothing was emitted.
    pub fn emit_advisory(
        &self,
        gate_result: &GateResult,
        synthesized_text: &str,
        advice_items: &[Advice],
        authority_override: Option<Authority>,
        meta: &EmitMeta,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let authority = authority_override.unwrap_or_else(|| gate_result.top_authority());

        let mut body = synthesized_text.trim().to_string();
        if body.is_empty() {
            body = compose_from_items(gate_result, advice_items);
        }
        if body.is_empty() {
            return None;
        }

        let formatted = format_advisory(authority, &body)?;

        {
            let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = sink.write_line(&formatted) {
                warn!("advisory sink write failed: {e}");
                return None;
            }
        }

        let record = json!({
            "ts": now_ts(),
            "text": truncate_chars(&formatted, 300),
            "chars": formatted.chars().count(),
            "authority": authority.as_str(),
            "phase": meta.phase.map(|p| p.as_str()),
            "route": if meta.route.is_empty() { None } else { Some(meta.route.as_str()) },
            "trace_id": meta.trace_id,
            "tool_name": meta.tool_name,
        });
        if let Err(e) = append_jsonl_capped(&self.log_path, &record, EMIT_LOG_MAX_LINES) {
            warn!("emission log append failed: {e}");
        }

        Some(formatted)
    }
}

/// Authority-specific formatting with the hard character budget.
fn format_advisory(authority: Authority, body: &str) -> Option<String> {
    match authority {
        Authority::Silent => None,
        Authority::Whisper => {
            let inner = truncate_on_word_boundary(body, WHISPER_MAX_CHARS.saturating_sub(9));
            Some(format!("(spark: {inner})"))
        }
        Authority::Note => {
            let budget = MAX_EMIT_CHARS - "[SPARK] ".len();
            Some(format!("[SPARK] {}", truncate_on_word_boundary(body, budget)))
        }
        Authority::Warning => {
            let budget = MAX_EMIT_CHARS - "[SPARK ADVISORY] ".len();
            Some(format!(
                "[SPARK ADVISORY] {}",
                truncate_on_word_boundary(body, budget)
            ))
        }
    }
}

/// Fallback body when synthesis came back empty: join the emitted items'
/// texts until the budget runs out.
fn compose_from_items(gate_result: &GateResult, advice_items: &[Advice]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for decision in &gate_result.emitted {
        let Some(item) = advice_items.iter().find(|i| i.advice_id == decision.advice_id) else {
            continue;
        };
        let text = item.text.trim();
        if text.is_empty() {
            continue;
        }
        if used + text.chars().count() > MAX_EMIT_CHARS {
            break;
        }
        used += text.chars().count() + 2;
        parts.push(text);
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::SparkHome;
    use crate::jsonl::read_jsonl;
    use crate::types::{AdviceSource, GateDecision};
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;

    struct SharedSink(Arc<StdMutex<Vec<String>>>);

    impl AdvisorySink for SharedSink {
        fn write_line(&mut self, text: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn emitter_with_buffer(dir: &TempDir) -> (Emitter, Arc<StdMutex<Vec<String>>>) {
        let home = SparkHome::at(dir.path());
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let emitter = Emitter::with_sink(&home, Box::new(SharedSink(lines.clone())));
        (emitter, lines)
    }

    fn result_with(authority: Authority) -> GateResult {
        GateResult {
            phase: TaskPhase::Implementation,
            total_retrieved: 1,
            decisions: Vec::new(),
            emitted: vec![GateDecision {
                advice_id: "a1".into(),
                authority,
                emit: true,
                reason: String::new(),
                adjusted_score: 0.8,
                original_score: 0.8,
            }],
            suppressed: Vec::new(),
        }
    }

    fn item(id: &str, text: &str) -> Advice {
        Advice {
            advice_id: id.into(),
            insight_key: String::new(),
            text: text.into(),
            confidence: 0.8,
            context_match: 0.8,
            source: AdviceSource::Cognitive,
            reason: String::new(),
            authority: None,
        }
    }

    #[test]
    fn test_note_prefix() {
        let dir = TempDir::new().unwrap();
        let (emitter, lines) = emitter_with_buffer(&dir);
        let out = emitter
            .emit_advisory(
                &result_with(Authority::Note),
                "Use batch mode for saves.",
                &[],
                None,
                &EmitMeta::default(),
            )
            .unwrap();
        assert!(out.starts_with("[SPARK] "));
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_warning_prefix() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let out = emitter
            .emit_advisory(
                &result_with(Authority::Warning),
                "Check imports before this edit.",
                &[],
                None,
                &EmitMeta::default(),
            )
            .unwrap();
        assert!(out.starts_with("[SPARK ADVISORY] "));
    }

    #[test]
    fn test_whisper_wrapped_and_short() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let long = "word ".repeat(100);
        let out = emitter
            .emit_advisory(&result_with(Authority::Whisper), &long, &[], None, &EmitMeta::default())
            .unwrap();
        assert!(out.starts_with("(spark: "));
        assert!(out.ends_with(')'));
        assert!(out.chars().count() <= WHISPER_MAX_CHARS + 2);
    }

    #[test]
    fn test_silent_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let (emitter, lines) = emitter_with_buffer(&dir);
        let result = GateResult::empty(TaskPhase::Implementation);
        let out = emitter.emit_advisory(&result, "text", &[], None, &EmitMeta::default());
        assert!(out.is_none());
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hard_char_budget() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let long = "alpha beta gamma ".repeat(100);
        let out = emitter
            .emit_advisory(&result_with(Authority::Note), &long, &[], None, &EmitMeta::default())
            .unwrap();
        assert!(out.chars().count() <= MAX_EMIT_CHARS);
        assert!(out.contains('…'));
    }

    #[test]
    fn test_fallback_composes_from_items() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let items = vec![item("a1", "Validate the schema first.")];
        let out = emitter
            .emit_advisory(&result_with(Authority::Note), "", &items, None, &EmitMeta::default())
            .unwrap();
        assert!(out.contains("Validate the schema first."));
    }

    #[test]
    fn test_empty_everything_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let out =
            emitter.emit_advisory(&result_with(Authority::Note), "", &[], None, &EmitMeta::default());
        assert!(out.is_none());
    }

    #[test]
    fn test_disabled_emitter_is_noop() {
        let dir = TempDir::new().unwrap();
        let (mut emitter, lines) = emitter_with_buffer(&dir);
        emitter.enabled = false;
        let out =
            emitter.emit_advisory(&result_with(Authority::Note), "text here", &[], None, &EmitMeta::default());
        assert!(out.is_none());
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_authority_override_wins() {
        let dir = TempDir::new().unwrap();
        let (emitter, _) = emitter_with_buffer(&dir);
        let out = emitter
            .emit_advisory(
                &result_with(Authority::Warning),
                "Fallback text body.",
                &[],
                Some(Authority::Note),
                &EmitMeta::default(),
            )
            .unwrap();
        assert!(out.starts_with("[SPARK] "));
    }

    #[test]
    fn test_emission_log_record() {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path());
        let (emitter, _) = emitter_with_buffer(&dir);
        let meta = EmitMeta {
            phase: Some(TaskPhase::Testing),
            route: "packet_exact".into(),
            trace_id: Some("t1".into()),
            tool_name: Some("Edit".into()),
        };
        emitter
            .emit_advisory(&result_with(Authority::Note), "Run the tests.", &[], None, &meta)
            .unwrap();
        let rows = read_jsonl(&home.emit_log());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["authority"], "note");
        assert_eq!(rows[0]["route"], "packet_exact");
        assert_eq!(rows[0]["tool_name"], "Edit");
        assert!(rows[0]["chars"].as_u64().unwrap() > 0);
    }
}
