//! Persistent per-session context for the advisory engine.
//!
//! Each hook invocation is a fresh short-lived process, so session context
//! lives in one JSON document per session under
//! `<spark_home>/advisory_state/`. State older than the session TTL is
//! treated as nonexistent on load; saves are atomic and evict stale
//! shown-advice entries.

use crate::home::SparkHome;
use crate::jsonl::atomic_write_json;
use crate::types::{IntentFamily, TaskPhase, TaskPlane};
use crate::util::{now_ts, sha1_hex, truncate_chars};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// State untouched for this long is discarded on load.
pub const SESSION_TTL_S: f64 = 2.0 * 3600.0;

/// Default TTL for shown-advice bookkeeping entries.
pub const SHOWN_ADVICE_TTL_S: f64 = 600.0;

/// Hard cap on shown-advice entries after save-time eviction.
pub const SHOWN_ADVICE_CAP: usize = 100;

const RECENT_TOOLS_MAX: usize = 30;
const PHASE_HISTORY_MAX: usize = 12;
const TRACE_RESOLVE_MAX_AGE_S: f64 = 600.0;

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub timestamp: f64,
    /// `None` for pre-tool records, `Some` once the outcome is known.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Short excerpt of the tool input (file path, command, …).
    #[serde(default)]
    pub input_hint: String,
}

/// One phase transition, kept as a short history for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: TaskPhase,
    pub at: f64,
}

/// Persistent record for one host session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: f64,
    pub updated_at: f64,

    #[serde(default)]
    pub recent_tools: Vec<ToolCall>,

    #[serde(default)]
    pub user_intent: String,
    #[serde(default)]
    pub user_intent_at: f64,

    #[serde(default)]
    pub intent_family: IntentFamily,
    #[serde(default)]
    pub intent_confidence: f64,
    #[serde(default)]
    pub task_plane: TaskPlane,
    #[serde(default)]
    pub intent_reason: String,

    #[serde(default)]
    pub task_phase: TaskPhase,
    #[serde(default)]
    pub phase_confidence: f64,
    #[serde(default)]
    pub phase_history: Vec<PhaseChange>,

    /// Advice key → timestamp shown. Holds both raw ids and scoped
    /// `advice_id|tool|phase` keys; either match suppresses re-emission.
    #[serde(default)]
    pub shown_advice_ids: HashMap<String, f64>,

    /// Tool name → suppression expiry timestamp.
    #[serde(default)]
    pub suppressed_tools: HashMap<String, f64>,

    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default)]
    pub last_advisory_packet_id: String,
    #[serde(default)]
    pub last_advisory_route: String,
    #[serde(default)]
    pub last_advisory_tool: String,
    #[serde(default)]
    pub last_advisory_advice_ids: Vec<String>,
    #[serde(default)]
    pub last_advisory_at: f64,
    #[serde(default)]
    pub last_advisory_text_fingerprint: String,
}

impl SessionState {
    pub fn new(session_id: &str) -> Self {
        let now = now_ts();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            updated_at: now,
            recent_tools: Vec::new(),
            user_intent: String::new(),
            user_intent_at: 0.0,
            intent_family: IntentFamily::default(),
            intent_confidence: 0.0,
            task_plane: TaskPlane::default(),
            intent_reason: String::new(),
            task_phase: TaskPhase::default(),
            phase_confidence: 0.0,
            phase_history: Vec::new(),
            shown_advice_ids: HashMap::new(),
            suppressed_tools: HashMap::new(),
            consecutive_failures: 0,
            last_advisory_packet_id: String::new(),
            last_advisory_route: String::new(),
            last_advisory_tool: String::new(),
            last_advisory_advice_ids: Vec::new(),
            last_advisory_at: 0.0,
            last_advisory_text_fingerprint: String::new(),
        }
    }

    /// Record a tool call, update the failure streak, and re-infer phase.
    pub fn record_tool_call(
        &mut self,
        tool_name: &str,
        tool_input: Option<&Value>,
        success: Option<bool>,
        trace_id: Option<&str>,
    ) {
        let call = ToolCall {
            tool_name: tool_name.to_string(),
            timestamp: now_ts(),
            success,
            trace_id: trace_id.map(str::to_string),
            input_hint: input_hint(tool_input),
        };
        self.recent_tools.push(call);
        if self.recent_tools.len() > RECENT_TOOLS_MAX {
            let overflow = self.recent_tools.len() - RECENT_TOOLS_MAX;
            self.recent_tools.drain(..overflow);
        }

        match success {
            Some(false) => self.consecutive_failures += 1,
            Some(true) => self.consecutive_failures = 0,
            None => {}
        }

        self.infer_phase(tool_name, tool_input);
    }

    pub fn record_user_intent(&mut self, text: &str) {
        self.user_intent = text.trim().to_string();
        self.user_intent_at = now_ts();
    }

    /// Mark advice as shown under both the raw id and a scoped key.
    pub fn mark_advice_shown(&mut self, advice_ids: &[String], tool_name: &str, phase: TaskPhase) {
        let now = now_ts();
        for id in advice_ids {
            if id.is_empty() {
                continue;
            }
            self.shown_advice_ids.insert(id.clone(), now);
            self.shown_advice_ids
                .insert(format!("{id}|{tool_name}|{}", phase.as_str()), now);
        }
    }

    pub fn suppress_tool_advice(&mut self, tool_name: &str, duration_s: f64) {
        if duration_s <= 0.0 {
            return;
        }
        self.suppressed_tools
            .insert(tool_name.to_string(), now_ts() + duration_s);
    }

    pub fn is_tool_suppressed(&self, tool_name: &str) -> bool {
        self.suppressed_tools
            .get(tool_name)
            .map(|expiry| *expiry > now_ts())
            .unwrap_or(false)
    }

    /// Was `file_path` Read within the last `within_s` seconds?
    ///
    /// Scans newest-to-oldest and stops at the first entry older than the
    /// window; `within_s == 0` therefore always returns false.
    pub fn had_recent_read(&self, file_path: &str, within_s: f64) -> bool {
        if within_s <= 0.0 || file_path.trim().is_empty() {
            return false;
        }
        let now = now_ts();
        let basename = file_path.rsplit(['/', '\\']).next().unwrap_or(file_path);
        for call in self.recent_tools.iter().rev() {
            if now - call.timestamp > within_s {
                break;
            }
            if call.tool_name == "Read"
                && (call.input_hint.contains(file_path) || call.input_hint.contains(basename))
            {
                return true;
            }
        }
        false
    }

    /// Resolve the trace id of the most recent matching tool call,
    /// preferring unresolved pre-tool records (`success == None`).
    pub fn resolve_recent_trace_id(&self, tool_name: &str, max_age_s: f64) -> Option<String> {
        let now = now_ts();
        let candidates: Vec<&ToolCall> = self
            .recent_tools
            .iter()
            .rev()
            .filter(|call| {
                call.tool_name == tool_name
                    && call.trace_id.is_some()
                    && now - call.timestamp <= max_age_s
            })
            .collect();
        candidates
            .iter()
            .find(|call| call.success.is_none())
            .or_else(|| candidates.first())
            .and_then(|call| call.trace_id.clone())
    }

    /// Last `n` tool names, oldest first.
    pub fn recent_tool_sequence(&self, n: usize) -> Vec<String> {
        let start = self.recent_tools.len().saturating_sub(n);
        self.recent_tools[start..]
            .iter()
            .map(|call| call.tool_name.clone())
            .collect()
    }

    /// Phase inference by priority: failure streak, Bash command shape,
    /// tool identity; otherwise the phase is left unchanged.
    fn infer_phase(&mut self, tool_name: &str, tool_input: Option<&Value>) {
        let inferred = if self.consecutive_failures >= 2 {
            Some((TaskPhase::Debugging, 0.9))
        } else if tool_name == "Bash" {
            let command = tool_input
                .and_then(|v| v.get("command"))
                .and_then(Value::as_str)
                .unwrap_or("");
            phase_from_command(command).map(|phase| (phase, 0.7))
        } else {
            phase_from_tool(tool_name).map(|phase| (phase, 0.6))
        };

        if let Some((phase, confidence)) = inferred {
            if phase != self.task_phase {
                self.phase_history.push(PhaseChange { phase, at: now_ts() });
                if self.phase_history.len() > PHASE_HISTORY_MAX {
                    let overflow = self.phase_history.len() - PHASE_HISTORY_MAX;
                    self.phase_history.drain(..overflow);
                }
            }
            self.task_phase = phase;
            self.phase_confidence = confidence;
        }
    }
}

static BASH_TESTING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(pytest|cargo test|npm test|go test|jest|unittest|tox)\b").unwrap()
});
static BASH_DEPLOY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(deploy|kubectl|helm|terraform|docker push|release)\b").unwrap()
});
static BASH_IMPL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(git commit|git add|cargo build|npm run build|make|gcc|rustc)\b").unwrap()
});
static BASH_DEBUG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(gdb|strace|traceback|debug|tail -f|journalctl)\b").unwrap()
});
static BASH_EXPLORE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(ls|find|cat|grep|rg|tree|head|wc)\b").unwrap());

fn phase_from_command(command: &str) -> Option<TaskPhase> {
    if command.trim().is_empty() {
        return None;
    }
    if BASH_TESTING_RE.is_match(command) {
        Some(TaskPhase::Testing)
    } else if BASH_DEPLOY_RE.is_match(command) {
        Some(TaskPhase::Deployment)
    } else if BASH_DEBUG_RE.is_match(command) {
        Some(TaskPhase::Debugging)
    } else if BASH_IMPL_RE.is_match(command) {
        Some(TaskPhase::Implementation)
    } else if BASH_EXPLORE_RE.is_match(command) {
        Some(TaskPhase::Exploration)
    } else {
        None
    }
}

fn phase_from_tool(tool_name: &str) -> Option<TaskPhase> {
    match tool_name {
        "Edit" | "Write" | "NotebookEdit" => Some(TaskPhase::Implementation),
        "Read" | "Grep" | "Glob" | "WebSearch" | "WebFetch" => Some(TaskPhase::Exploration),
        "TodoWrite" | "Task" => Some(TaskPhase::Planning),
        _ => None,
    }
}

fn input_hint(tool_input: Option<&Value>) -> String {
    let Some(input) = tool_input else { return String::new() };
    for key in ["file_path", "command", "pattern", "url", "prompt", "query"] {
        if let Some(text) = input.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return truncate_chars(text.trim(), 120);
            }
        }
    }
    String::new()
}

/// Loads and saves session state documents.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: std::path::PathBuf,
    pub session_ttl_s: f64,
    pub shown_ttl_s: f64,
}

impl StateStore {
    pub fn new(home: &SparkHome) -> Self {
        Self {
            dir: home.state_dir(),
            session_ttl_s: SESSION_TTL_S,
            shown_ttl_s: SHOWN_ADVICE_TTL_S,
        }
    }

    /// State file name: sanitized session id plus a sha1 suffix for
    /// collision safety with exotic ids.
    fn state_path(&self, session_id: &str) -> std::path::PathBuf {
        let safe: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(40)
            .collect();
        let safe = if safe.is_empty() { "session".to_string() } else { safe };
        let suffix = &sha1_hex(session_id)[..8];
        self.dir.join(format!("{safe}_{suffix}.json"))
    }

    /// Load state for a session; stale or corrupt files yield fresh state.
    pub fn load(&self, session_id: &str) -> SessionState {
        let path = self.state_path(session_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return SessionState::new(session_id),
        };
        match serde_json::from_str::<SessionState>(&raw) {
            Ok(state) if now_ts() - state.updated_at <= self.session_ttl_s => state,
            Ok(_) => {
                debug!(session_id, "session state expired, starting fresh");
                SessionState::new(session_id)
            }
            Err(e) => {
                debug!(session_id, "session state unparseable ({e}), starting fresh");
                SessionState::new(session_id)
            }
        }
    }

    /// Persist state atomically, evicting stale shown-advice entries first.
    pub fn save(&self, state: &mut SessionState) -> crate::error::Result<()> {
        state.updated_at = now_ts();
        self.evict_shown(state);
        let path = self.state_path(&state.session_id);
        atomic_write_json(&path, &serde_json::to_value(&*state)?)
    }

    fn evict_shown(&self, state: &mut SessionState) {
        let now = now_ts();
        state
            .shown_advice_ids
            .retain(|_, shown_at| now - *shown_at <= self.shown_ttl_s);
        if state.shown_advice_ids.len() > SHOWN_ADVICE_CAP {
            let mut entries: Vec<(String, f64)> = state
                .shown_advice_ids
                .drain()
                .collect();
            entries.sort_by(|a, b| b.1.total_cmp(&a.1));
            entries.truncate(SHOWN_ADVICE_CAP);
            state.shown_advice_ids = entries.into_iter().collect();
        }
    }
}

/// Default trace-resolution window used by the post-tool hook.
pub fn resolve_recent_trace_id(state: &SessionState, tool_name: &str) -> Option<String> {
    state.resolve_recent_trace_id(tool_name, TRACE_RESOLVE_MAX_AGE_S)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path());
        home.ensure_dirs().unwrap();
        let store = StateStore::new(&home);
        (dir, store)
    }

    #[test]
    fn test_load_missing_creates_fresh() {
        let (_dir, store) = store();
        let state = store.load("sess-1");
        assert_eq!(state.session_id, "sess-1");
        assert!(state.recent_tools.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let mut state = store.load("sess-2");
        state.record_user_intent("harden auth");
        state.record_tool_call("Edit", Some(&json!({"file_path": "/repo/auth.rs"})), None, Some("t1"));
        store.save(&mut state).unwrap();

        let back = store.load("sess-2");
        assert_eq!(back.user_intent, "harden auth");
        assert_eq!(back.recent_tools.len(), 1);
        assert_eq!(back.recent_tools[0].input_hint, "/repo/auth.rs");
        assert_eq!(back.task_phase, TaskPhase::Implementation);
    }

    #[test]
    fn test_stale_state_discarded_on_load() {
        let (_dir, store) = store();
        let mut state = store.load("sess-3");
        state.record_user_intent("old work");
        store.save(&mut state).unwrap();

        // Rewrite with an ancient updated_at.
        let path = store.state_path("sess-3");
        let mut doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc["updated_at"] = json!(now_ts() - SESSION_TTL_S - 10.0);
        std::fs::write(&path, doc.to_string()).unwrap();

        let fresh = store.load("sess-3");
        assert!(fresh.user_intent.is_empty());
    }

    #[test]
    fn test_corrupt_state_treated_as_absent() {
        let (_dir, store) = store();
        let path = store.state_path("sess-4");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{broken").unwrap();
        let state = store.load("sess-4");
        assert!(state.recent_tools.is_empty());
    }

    #[test]
    fn test_failure_streak_and_debugging_phase() {
        let mut state = SessionState::new("s");
        state.record_tool_call("Bash", Some(&json!({"command": "cargo build"})), Some(false), None);
        assert_eq!(state.consecutive_failures, 1);
        state.record_tool_call("Bash", Some(&json!({"command": "cargo build"})), Some(false), None);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.task_phase, TaskPhase::Debugging);
        assert!((state.phase_confidence - 0.9).abs() < 1e-9);

        state.record_tool_call("Bash", Some(&json!({"command": "cargo build"})), Some(true), None);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_pre_tool_success_none_keeps_streak() {
        let mut state = SessionState::new("s");
        state.record_tool_call("Edit", None, Some(false), None);
        state.record_tool_call("Edit", None, None, None);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_bash_command_phase_table() {
        let mut state = SessionState::new("s");
        state.record_tool_call("Bash", Some(&json!({"command": "pytest tests/"})), Some(true), None);
        assert_eq!(state.task_phase, TaskPhase::Testing);
        state.record_tool_call("Bash", Some(&json!({"command": "kubectl apply -f x.yaml"})), Some(true), None);
        assert_eq!(state.task_phase, TaskPhase::Deployment);
        state.record_tool_call("Bash", Some(&json!({"command": "ls -la src"})), Some(true), None);
        assert_eq!(state.task_phase, TaskPhase::Exploration);
    }

    #[test]
    fn test_unknown_tool_leaves_phase_unchanged() {
        let mut state = SessionState::new("s");
        state.record_tool_call("Edit", None, None, None);
        assert_eq!(state.task_phase, TaskPhase::Implementation);
        state.record_tool_call("SomeMcpTool", None, None, None);
        assert_eq!(state.task_phase, TaskPhase::Implementation);
    }

    #[test]
    fn test_shown_advice_scoped_keys() {
        let mut state = SessionState::new("s");
        state.mark_advice_shown(&["a1".to_string()], "Edit", TaskPhase::Implementation);
        assert!(state.shown_advice_ids.contains_key("a1"));
        assert!(state.shown_advice_ids.contains_key("a1|Edit|implementation"));
    }

    #[test]
    fn test_shown_advice_cap_keeps_most_recent() {
        let (_dir, store) = store();
        let mut state = SessionState::new("cap");
        let now = now_ts();
        for i in 0..150 {
            state
                .shown_advice_ids
                .insert(format!("adv_{i}"), now - (i as f64) * 0.001);
        }
        store.save(&mut state).unwrap();
        assert!(state.shown_advice_ids.len() <= SHOWN_ADVICE_CAP);
        // The newest entry survives.
        assert!(state.shown_advice_ids.contains_key("adv_0"));
    }

    #[test]
    fn test_tool_suppression_window() {
        let mut state = SessionState::new("s");
        assert!(!state.is_tool_suppressed("Edit"));
        state.suppress_tool_advice("Edit", 60.0);
        assert!(state.is_tool_suppressed("Edit"));
        assert!(!state.is_tool_suppressed("Read"));
    }

    #[test]
    fn test_had_recent_read() {
        let mut state = SessionState::new("s");
        state.record_tool_call("Read", Some(&json!({"file_path": "/repo/sybil.py"})), None, None);
        assert!(state.had_recent_read("/repo/sybil.py", 120.0));
        assert!(state.had_recent_read("sybil.py", 120.0));
        assert!(!state.had_recent_read("other.py", 120.0));
        assert!(!state.had_recent_read("/repo/sybil.py", 0.0));
    }

    #[test]
    fn test_resolve_trace_prefers_unresolved_pre_tool() {
        let now = now_ts();
        let mut state = SessionState::new("s1");
        state.recent_tools = vec![
            ToolCall {
                tool_name: "Edit".into(),
                timestamp: now - 4.0,
                success: Some(true),
                trace_id: Some("trace-post".into()),
                input_hint: String::new(),
            },
            ToolCall {
                tool_name: "Edit".into(),
                timestamp: now - 2.0,
                success: None,
                trace_id: Some("trace-pre".into()),
                input_hint: String::new(),
            },
        ];
        assert_eq!(resolve_recent_trace_id(&state, "Edit").as_deref(), Some("trace-pre"));
    }

    #[test]
    fn test_resolve_trace_ignores_stale_entries() {
        let now = now_ts();
        let mut state = SessionState::new("s2");
        state.recent_tools = vec![ToolCall {
            tool_name: "Bash".into(),
            timestamp: now - 900.0,
            success: None,
            trace_id: Some("trace-old".into()),
            input_hint: String::new(),
        }];
        assert_eq!(state.resolve_recent_trace_id("Bash", 120.0), None);
    }

    #[test]
    fn test_recent_tool_sequence_window() {
        let mut state = SessionState::new("s");
        for tool in ["Read", "Grep", "Edit", "Bash"] {
            state.record_tool_call(tool, None, None, None);
        }
        assert_eq!(state.recent_tool_sequence(2), vec!["Edit", "Bash"]);
        assert_eq!(state.recent_tool_sequence(10).len(), 4);
    }
}
