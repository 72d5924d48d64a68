//! Advisory gate: decides IF and WHEN to surface advice.
//!
//! The gate sits between "we have advice" and "we should show it". Most
//! advisory systems fail by showing too much, too often, at the wrong
//! time; the gate filters candidates through repetition, cooldown, and
//! obviousness checks, scores what survives against the session phase,
//! and assigns a graduated authority level with a per-call emission
//! budget. Evaluation reads state but never mutates it.

use crate::config::GateConfig;
use crate::state::SessionState;
use crate::types::{Advice, Authority, GateDecision, GateResult, TaskPhase};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Window in which a prior Read of the same file makes "read before edit"
/// advice redundant.
const RECENT_READ_WINDOW_S: f64 = 120.0;

/// Score band below the NOTE threshold eligible for the actionable boost.
const ACTIONABLE_BAND: f64 = 0.08;

static READ_BEFORE_EDIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bread\b.{0,40}\bbefore\b.{0,20}\bedit").unwrap());
static GENERIC_READ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(always\s+)?read\b").unwrap());
static DEPLOYMENT_FLAVOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(deploy|deployment|rollback|release|production)\b").unwrap());
static TELEMETRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)tool_\d+_error|cycle summary|\d+\s+calls to \w+|\[spark core intelligence\]")
        .unwrap()
});
static NEGATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(don't|do not|avoid|never|watch out|caution|warning|careful|danger|past failure|failed when|broke)\b",
    )
    .unwrap()
});
static CAUTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[caution\]|\[past failure\]|\[warning\]|⚠|❗").unwrap());
static ARROW_CHAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+\s*(→|->)\s*\w+\s*(→|->)\s*\w+").unwrap());
static SUCCESS_RATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d+\s*%\s*success").unwrap());
static INVOCATION_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(used|called|invoked)\s+\d+\s+times\b").unwrap());
static GENERIC_FILLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)use standard approach").unwrap());
static ACTIONABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(run|check|verify|use|add|validate|call|test|review|measure)\b").unwrap()
});

/// Tool-specific advice only makes sense on its own tool.
const TOOL_SPECIFIC: &[&str] = &["WebFetch", "WebSearch", "NotebookEdit"];

/// Per-source scale applied to the shown-advice repeat TTL. Deterministic
/// baselines can repeat sooner than distilled insights.
pub fn source_ttl_scale(source: &str) -> f64 {
    match source {
        "cognitive" => 1.0,
        "eidos" => 1.1,
        "outcomes" => 0.9,
        "baseline" => 0.5,
        "prefetch" => 0.6,
        "packet" => 0.8,
        _ => 1.0,
    }
}

/// Per-category scale applied to the shown-advice repeat TTL.
pub fn category_ttl_scale(category: &str) -> f64 {
    match category {
        "self_awareness" => 1.2,
        "context" => 0.8,
        "history" => 0.9,
        _ => 1.0,
    }
}

/// Per-tool scale on the tool advisory cooldown. Cheap read tools can see
/// advice again quickly; mutating tools get the longer pause.
pub fn tool_cooldown_scale(tool_name: &str) -> f64 {
    match tool_name {
        "Read" | "Grep" | "Glob" => 0.5,
        "Edit" | "Write" | "NotebookEdit" => 1.2,
        _ => 1.0,
    }
}

/// Multi-filter gate with hot-reloadable thresholds.
#[derive(Debug, Clone)]
pub struct Gate {
    pub cfg: GateConfig,
}

impl Gate {
    pub fn new(mut cfg: GateConfig) -> Self {
        cfg.enforce_threshold_order();
        Self { cfg }
    }

    /// Effective cooldown applied after emitting on a tool.
    pub fn tool_cooldown_s(&self, tool_name: &str) -> f64 {
        self.cfg.tool_cooldown_s * tool_cooldown_scale(tool_name)
    }

    /// Repeat TTL for a given advice category/source pair.
    pub fn shown_ttl_for(&self, category: &str, source: &str) -> (f64, f64) {
        let scale = category_ttl_scale(category) * source_ttl_scale(source);
        (self.cfg.advice_repeat_cooldown_s * scale, scale)
    }

    /// Evaluate candidates against session state. Pure aside from reading
    /// `state`; never mutates it.
    pub fn evaluate(
        &self,
        items: &[Advice],
        state: &SessionState,
        tool_name: &str,
        tool_input: Option<&Value>,
    ) -> GateResult {
        let phase = effective_phase(state);
        if items.is_empty() {
            return GateResult::empty(phase);
        }

        let mut decisions: Vec<GateDecision> = items
            .iter()
            .map(|item| self.evaluate_single(item, state, tool_name, tool_input, phase))
            .collect();

        // Budget pass: emitters sorted by adjusted score, capped. A WARNING
        // inside the slice raises the effective cap by one.
        let mut emit_order: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.emit)
            .map(|(i, _)| i)
            .collect();
        emit_order.sort_by(|a, b| decisions[*b].adjusted_score.total_cmp(&decisions[*a].adjusted_score));

        let mut cap = self.cfg.max_emit_per_call;
        if emit_order
            .iter()
            .any(|i| decisions[*i].authority == Authority::Warning)
        {
            cap += 1;
        }
        for index in emit_order.iter().skip(cap) {
            decisions[*index].emit = false;
            decisions[*index].reason = "budget exhausted".to_string();
        }
        emit_order.truncate(cap);

        let emitted: Vec<GateDecision> = emit_order
            .iter()
            .map(|i| decisions[*i].clone())
            .collect();
        let suppressed: Vec<GateDecision> = decisions
            .iter()
            .filter(|d| !d.emit)
            .cloned()
            .collect();

        GateResult {
            phase,
            total_retrieved: items.len(),
            decisions,
            emitted,
            suppressed,
        }
    }

    fn evaluate_single(
        &self,
        item: &Advice,
        state: &SessionState,
        tool_name: &str,
        tool_input: Option<&Value>,
        phase: TaskPhase,
    ) -> GateDecision {
        let original_score = item.confidence * item.context_match;
        let silent = |reason: String, adjusted: f64| GateDecision {
            advice_id: item.advice_id.clone(),
            authority: Authority::Silent,
            emit: false,
            reason,
            adjusted_score: adjusted,
            original_score,
        };

        // Filter 1: already shown within the source-scaled repeat TTL.
        let (shown_ttl, _) = self.shown_ttl_for(item.category(), item.source.as_str());
        let scoped_key = format!("{}|{tool_name}|{}", item.advice_id, phase.as_str());
        let now = crate::util::now_ts();
        let shown_at = state
            .shown_advice_ids
            .get(&item.advice_id)
            .or_else(|| state.shown_advice_ids.get(&scoped_key));
        if let Some(at) = shown_at {
            let age = now - at;
            if age <= shown_ttl {
                return silent(format!("already shown {age:.0}s ago"), original_score);
            }
        }

        // Filter 2: tool-level advisory cooldown.
        if state.is_tool_suppressed(tool_name) {
            return silent(format!("tool cooldown active for {tool_name}"), original_score);
        }

        // Filter 3: obvious from context.
        if let Some(reason) = obvious_suppression(&item.text, tool_name, tool_input, state, phase) {
            return silent(reason, original_score);
        }

        // Scoring: phase relevance, then negative/failure boosts.
        let mut adjusted = original_score * phase_category_multiplier(phase, item.category());
        if NEGATIVE_RE.is_match(&item.text) {
            adjusted *= 1.3;
        }
        if state.consecutive_failures >= 1 && CAUTION_RE.is_match(&item.text) {
            adjusted *= 1.5;
        }

        let authority = self.assign_authority(adjusted, &item.text);
        GateDecision {
            advice_id: item.advice_id.clone(),
            authority,
            emit: authority.emits(),
            reason: format!(
                "phase={}, score={:.2}, authority={}",
                phase.as_str(),
                adjusted,
                authority.as_str()
            ),
            adjusted_score: adjusted,
            original_score,
        }
    }

    /// Map an adjusted score to an authority level.
    pub fn assign_authority(&self, score: f64, text: &str) -> Authority {
        // Primitive-noise override beats any score.
        if is_primitive_noise(text) {
            return Authority::Silent;
        }
        if score >= self.cfg.warning_threshold {
            return if is_caution_or_negative(text) {
                Authority::Warning
            } else {
                Authority::Note
            };
        }
        if score >= self.cfg.note_threshold {
            return Authority::Note;
        }
        if score >= self.cfg.note_threshold - ACTIONABLE_BAND && ACTIONABLE_RE.is_match(text) {
            return Authority::Note;
        }
        if score >= self.cfg.whisper_threshold {
            return Authority::Whisper;
        }
        Authority::Silent
    }
}

/// Phase × category relevance table. All multipliers live here; everything
/// not listed is 1.0.
fn phase_category_multiplier(phase: TaskPhase, category: &str) -> f64 {
    match (phase, category) {
        (TaskPhase::Debugging, "self_awareness") => 1.5,
        (TaskPhase::Debugging, "history") => 1.3,
        (TaskPhase::Debugging, "wisdom") => 1.2,
        (TaskPhase::Deployment, "wisdom") => 1.5,
        (TaskPhase::Deployment, "self_awareness") => 1.3,
        (TaskPhase::Implementation, "self_awareness") => 1.4,
        (TaskPhase::Implementation, "wisdom") => 1.2,
        (TaskPhase::Exploration, "context") => 1.3,
        (TaskPhase::Exploration, "wisdom") => 1.1,
        (TaskPhase::Planning, "wisdom") => 1.3,
        (TaskPhase::Planning, "context") => 1.2,
        (TaskPhase::Testing, "self_awareness") => 1.2,
        (TaskPhase::Testing, "wisdom") => 1.2,
        _ => 1.0,
    }
}

/// A failure streak overrides the recorded phase for scoring purposes.
fn effective_phase(state: &SessionState) -> TaskPhase {
    if state.consecutive_failures >= 2 {
        TaskPhase::Debugging
    } else {
        state.task_phase
    }
}

fn is_caution_or_negative(text: &str) -> bool {
    CAUTION_RE.is_match(text) || NEGATIVE_RE.is_match(text)
}

/// Noise no score can rescue: fragments, tool-sequence arrows, bare stats.
fn is_primitive_noise(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() < 15
        || ARROW_CHAIN_RE.is_match(trimmed)
        || SUCCESS_RATE_RE.is_match(trimmed)
        || INVOCATION_COUNT_RE.is_match(trimmed)
        || GENERIC_FILLER_RE.is_match(trimmed)
}

/// Text-pattern heuristics for advice that is obvious from context.
/// Returns the rule name when suppression applies.
fn obvious_suppression(
    text: &str,
    tool_name: &str,
    tool_input: Option<&Value>,
    state: &SessionState,
    phase: TaskPhase,
) -> Option<String> {
    if READ_BEFORE_EDIT_RE.is_match(text) {
        if tool_name != "Edit" {
            return Some(format!("read-before-edit advice on non-Edit tool {tool_name}"));
        }
        let file_path = tool_input
            .and_then(|input| input.get("file_path"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !file_path.is_empty() && state.had_recent_read(file_path, RECENT_READ_WINDOW_S) {
            return Some(format!("file {file_path} was read recently"));
        }
    }

    if tool_name == "Read" && GENERIC_READ_RE.is_match(text) {
        return Some("read advice while already reading".to_string());
    }

    for specific in TOOL_SPECIFIC {
        if tool_name != *specific
            && text.to_lowercase().contains(&specific.to_lowercase())
        {
            return Some(format!("{specific}-specific advice on {tool_name}"));
        }
    }

    if TELEMETRY_RE.is_match(text) {
        return Some("telemetry-shaped text".to_string());
    }

    if phase == TaskPhase::Exploration && DEPLOYMENT_FLAVOR_RE.is_match(text) {
        return Some("deployment advice during exploration".to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AdviceSource;
    use serde_json::json;

    fn advice(id: &str, text: &str, confidence: f64, context_match: f64) -> Advice {
        Advice {
            advice_id: id.to_string(),
            insight_key: String::new(),
            text: text.to_string(),
            confidence,
            context_match,
            source: AdviceSource::Cognitive,
            reason: String::new(),
            authority: None,
        }
    }

    fn gate() -> Gate {
        Gate::new(GateConfig::default())
    }

    fn state_with_phase(phase: TaskPhase) -> SessionState {
        let mut state = SessionState::new("test");
        state.task_phase = phase;
        state
    }

    #[test]
    fn test_empty_candidates_yield_empty_result() {
        let result = gate().evaluate(&[], &SessionState::new("s"), "Read", None);
        assert!(result.emitted.is_empty());
        assert!(result.suppressed.is_empty());
        assert_eq!(result.total_retrieved, 0);
    }

    #[test]
    fn test_high_value_note_emits() {
        // End-to-end scenario: strong actionable advice on Edit, empty state.
        let items = vec![advice(
            "adv_batch",
            "Use batch mode for saves — reduces I/O by 66x. Call begin_batch() before the loop.",
            0.85,
            0.80,
        )];
        let result = gate().evaluate(&items, &SessionState::new("s"), "Edit", None);
        assert_eq!(result.emitted.len(), 1);
        assert_eq!(result.emitted[0].authority, Authority::Note);
    }

    #[test]
    fn test_cycle_summary_noise_suppressed() {
        let items = vec![advice(
            "adv_cycle",
            "Cycle summary: Edit used 9 times (100% success); 17/17 Edits not preceded by Read.",
            0.60,
            0.40,
        )];
        let result = gate().evaluate(&items, &SessionState::new("s"), "Edit", None);
        assert!(result.emitted.is_empty());
        assert_eq!(result.suppressed.len(), 1);
        assert_eq!(result.suppressed[0].authority, Authority::Silent);
    }

    #[test]
    fn test_webfetch_advice_on_wrong_tool() {
        let items = vec![advice(
            "adv_wf",
            "WebFetch fails on authenticated URLs — use specialized MCP tools.",
            0.75,
            0.70,
        )];
        let on_edit = gate().evaluate(&items, &SessionState::new("s"), "Edit", None);
        assert!(on_edit.emitted.is_empty());
        assert!(on_edit.suppressed[0].reason.contains("WebFetch"));

        let on_webfetch = gate().evaluate(&items, &SessionState::new("s"), "WebFetch", None);
        assert_eq!(on_webfetch.emitted.len(), 1);
        assert_eq!(on_webfetch.emitted[0].authority, Authority::Note);
    }

    #[test]
    fn test_warning_boost_under_failure_streak() {
        let mut state = SessionState::new("s");
        state.consecutive_failures = 2;
        let mut item = advice(
            "adv_caution",
            "[Caution] Check imports — past failure with circular dependencies.",
            0.65,
            0.55,
        );
        item.source = AdviceSource::Eidos;
        let result = gate().evaluate(&[item], &state, "Edit", None);
        assert_eq!(result.emitted.len(), 1);
        let decision = &result.emitted[0];
        assert!(decision.adjusted_score > 0.70, "score was {}", decision.adjusted_score);
        assert_eq!(decision.authority, Authority::Warning);
    }

    #[test]
    fn test_already_shown_suppressed_within_ttl() {
        let mut state = SessionState::new("s");
        state
            .shown_advice_ids
            .insert("adv_dedup_v".to_string(), crate::util::now_ts() - 10.0);
        let items = vec![advice("adv_dedup_v", "Run the focused test suite after this edit.", 0.8, 0.7)];
        let result = gate().evaluate(&items, &state, "Edit", None);
        assert!(result.emitted.is_empty());
        assert!(result.suppressed[0].reason.contains("shown"));
    }

    #[test]
    fn test_shown_ttl_allows_after_expiry() {
        let mut state = state_with_phase(TaskPhase::Implementation);
        state
            .shown_advice_ids
            .insert("adv_old".to_string(), crate::util::now_ts() - 10_000.0);
        let items = vec![advice("adv_old", "Run the focused test suite after this edit.", 0.8, 0.7)];
        let result = gate().evaluate(&items, &state, "Edit", None);
        assert_eq!(result.emitted.len(), 1);
    }

    #[test]
    fn test_tool_cooldown_suppresses() {
        let mut state = state_with_phase(TaskPhase::Implementation);
        state.suppress_tool_advice("Edit", 60.0);
        let items = vec![advice("adv_cd", "Run the focused test suite after this edit.", 0.8, 0.7)];
        let result = gate().evaluate(&items, &state, "Edit", None);
        assert!(result.emitted.is_empty());
        assert!(result.suppressed[0].reason.contains("cooldown"));
    }

    #[test]
    fn test_read_before_edit_suppressed_on_bash() {
        let items = vec![advice(
            "adv_rbe",
            "Always read a file before editing to verify current state",
            0.8,
            0.7,
        )];
        let result = gate().evaluate(&items, &state_with_phase(TaskPhase::Implementation), "Bash", None);
        assert!(result.emitted.is_empty());
        assert!(result.suppressed[0].reason.contains("read-before-edit"));
    }

    #[test]
    fn test_read_before_edit_suppressed_after_recent_read() {
        let mut state = state_with_phase(TaskPhase::Implementation);
        state.record_tool_call("Read", Some(&json!({"file_path": "/repo/pool.rs"})), None, None);
        let items = vec![advice(
            "adv_rbe2",
            "Read the target file before editing it.",
            0.8,
            0.7,
        )];
        let result = gate().evaluate(
            &items,
            &state,
            "Edit",
            Some(&json!({"file_path": "/repo/pool.rs"})),
        );
        assert!(result.emitted.is_empty());
        assert!(result.suppressed[0].reason.contains("read recently"));
    }

    #[test]
    fn test_primitive_noise_overrides_high_score() {
        assert_eq!(gate().assign_authority(0.95, "Bash → Edit → Read"), Authority::Silent);
        assert_eq!(gate().assign_authority(0.95, "Read → Edit → Write"), Authority::Silent);
        assert_eq!(gate().assign_authority(0.9, "ok"), Authority::Silent);
    }

    #[test]
    fn test_authority_thresholds() {
        let g = gate();
        // High score + caution → WARNING.
        assert_eq!(
            g.assign_authority(0.85, "[Caution] Don't skip input validation here"),
            Authority::Warning
        );
        // High score, no caution → NOTE.
        assert_eq!(
            g.assign_authority(0.85, "Connection pooling improves sustained throughput"),
            Authority::Note
        );
        // Exactly at a threshold gets the level at the threshold.
        assert_eq!(
            g.assign_authority(0.50, "Connection pooling improves sustained throughput"),
            Authority::Note
        );
        assert_eq!(
            g.assign_authority(0.40, "Something moderately interesting about architecture"),
            Authority::Whisper
        );
        assert_eq!(
            g.assign_authority(0.10, "Something quite weak about the architecture"),
            Authority::Silent
        );
    }

    #[test]
    fn test_actionable_micro_boost() {
        let g = gate();
        // 0.45 is inside the 0.08 band below NOTE (0.50) and actionable.
        assert_eq!(
            g.assign_authority(0.45, "Run cargo fmt after generating the module"),
            Authority::Note
        );
        // Same score, no actionable verb → WHISPER.
        assert_eq!(
            g.assign_authority(0.45, "Sustained throughput depends mostly on pooling"),
            Authority::Whisper
        );
    }

    #[test]
    fn test_budget_cap_and_reason() {
        let items: Vec<Advice> = (0..5)
            .map(|i| {
                advice(
                    &format!("adv_{i}"),
                    "Run the focused test suite covering the changed module.",
                    0.9 - i as f64 * 0.02,
                    0.8,
                )
            })
            .collect();
        let result = gate().evaluate(&items, &state_with_phase(TaskPhase::Implementation), "Edit", None);
        assert_eq!(result.emitted.len(), 2);
        assert!(result
            .suppressed
            .iter()
            .any(|d| d.reason == "budget exhausted"));
        // Ordered by adjusted score descending.
        assert!(result.emitted[0].adjusted_score >= result.emitted[1].adjusted_score);
    }

    #[test]
    fn test_warning_raises_budget_by_one() {
        let mut items = vec![advice(
            "warn_1",
            "[Caution] Avoid eval() in production paths — past failure broke release",
            0.95,
            0.9,
        )];
        items.push(advice("note_1", "Use parameterized queries for database access", 0.8, 0.7));
        items.push(advice("note_2", "Check connection pooling for better throughput", 0.75, 0.7));
        let result = gate().evaluate(&items, &state_with_phase(TaskPhase::Implementation), "Edit", None);
        assert_eq!(result.emitted.len(), 3);
        assert_eq!(result.emitted[0].authority, Authority::Warning);
    }

    #[test]
    fn test_debugging_phase_boosts_self_awareness() {
        let mut item = advice(
            "adv_sa",
            "[Past Failure] You tend to miss edge cases in error handling",
            0.8,
            0.6,
        );
        item.insight_key = "self_awareness:past_failure".to_string();
        let result = gate().evaluate(&[item], &state_with_phase(TaskPhase::Debugging), "Bash", None);
        let decision = &result.decisions[0];
        assert!(decision.adjusted_score > decision.original_score);
    }

    #[test]
    fn test_deployment_advice_suppressed_during_exploration() {
        let items = vec![advice(
            "adv_dep",
            "Verify the rollback path before any production release step.",
            0.8,
            0.7,
        )];
        let explore = gate().evaluate(&items, &state_with_phase(TaskPhase::Exploration), "Bash", None);
        assert!(explore.emitted.is_empty());
        let deploy = gate().evaluate(&items, &state_with_phase(TaskPhase::Deployment), "Bash", None);
        assert_eq!(deploy.emitted.len(), 1);
    }

    #[test]
    fn test_cooldown_and_ttl_scales() {
        assert_eq!(tool_cooldown_scale("Read"), 0.5);
        assert_eq!(tool_cooldown_scale("Edit"), 1.2);
        assert_eq!(tool_cooldown_scale("UnknownTool"), 1.0);
        assert_eq!(source_ttl_scale("cognitive"), 1.0);
        assert_eq!(source_ttl_scale("baseline"), 0.5);
        assert_eq!(source_ttl_scale("unknown_source"), 1.0);

        let g = gate();
        let (ttl_cognitive, scale_cognitive) = g.shown_ttl_for("wisdom", "cognitive");
        assert!(scale_cognitive >= 0.9);
        assert!(ttl_cognitive > 0.0);
        let (_, scale_baseline) = g.shown_ttl_for("context", "baseline");
        assert!(scale_baseline <= 0.6);
    }

    #[test]
    fn test_misordered_thresholds_clamp() {
        let mut cfg = GateConfig::default();
        cfg.warning_threshold = 0.4;
        cfg.note_threshold = 0.9;
        cfg.whisper_threshold = 0.8;
        let g = Gate::new(cfg);
        assert!(g.cfg.warning_threshold >= g.cfg.note_threshold);
        assert!(g.cfg.note_threshold >= g.cfg.whisper_threshold);
    }

    #[test]
    fn test_gate_does_not_mutate_state() {
        let state = state_with_phase(TaskPhase::Implementation);
        let shown_before = state.shown_advice_ids.len();
        let items = vec![advice("adv_x", "Run the focused test suite after this edit.", 0.8, 0.7)];
        let _ = gate().evaluate(&items, &state, "Edit", None);
        assert_eq!(state.shown_advice_ids.len(), shown_before);
    }
}
