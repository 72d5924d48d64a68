//! Live advisor: ranked advice candidates when no packet is suitable.
//!
//! Builds typed candidates from the memory-fusion bundle plus a small
//! static rule table keyed by tool, bounded by the `advisor` tuneables.
//! Also owns the advice feedback bookkeeping: request records for
//! later feedback collection and the outcome reports consumed by the
//! outcome log (and therefore by fusion on the next hook).

use crate::config::AdvisorConfig;
use crate::fusion::MemoryBundle;
use crate::home::SparkHome;
use crate::jsonl::{append_jsonl_capped, atomic_write_json, read_json_file, tail_jsonl};
use crate::types::{Advice, AdviceSource};
use crate::util::{keyword_overlap, now_ts, sha1_hex};
use serde_json::{json, Value};
use tracing::debug;

const FEEDBACK_REQUESTS_MAX_LINES: usize = 500;
const OUTCOMES_MAX_LINES: usize = 2000;

/// Static per-tool rules that apply even with thin memory.
const STATIC_RULES: &[(&str, &str, &str, f64)] = &[
    (
        "Edit",
        "wisdom:test_after_edit",
        "Run the focused tests for the changed file before moving on.",
        0.62,
    ),
    (
        "Write",
        "wisdom:review_generated_file",
        "Review the generated file against neighboring code conventions before continuing.",
        0.58,
    ),
    (
        "Bash",
        "wisdom:check_exit_status",
        "Check command output and exit status before chaining further commands.",
        0.58,
    ),
    (
        "WebFetch",
        "context:webfetch_auth",
        "WebFetch fails on authenticated URLs — use specialized MCP tools for those.",
        0.60,
    ),
];

fn insight_key_for(source: AdviceSource, id: &str) -> String {
    let prefix = match source {
        AdviceSource::Cognitive | AdviceSource::Eidos => "wisdom",
        AdviceSource::Outcomes => "history",
        _ => "context",
    };
    format!("{prefix}:{id}")
}

/// One recorded advice request, for feedback correlation.
#[derive(Debug, Clone)]
pub struct AdviceRequest {
    pub session_id: String,
    pub tool: String,
    pub advice_ids: Vec<String>,
    pub advice_texts: Vec<String>,
    pub sources: Vec<String>,
    pub trace_id: Option<String>,
    pub route: String,
    pub packet_id: Option<String>,
}

/// Live advisor over a Spark home.
pub struct Advisor {
    home: SparkHome,
    pub cfg: AdvisorConfig,
}

impl Advisor {
    pub fn new(home: &SparkHome, cfg: AdvisorConfig) -> Self {
        Self { home: home.clone(), cfg }
    }

    /// Rank raw advice for `(tool, intent)` from fused evidence plus the
    /// static rule table. Bounded in count and by a minimum rank score.
    pub fn advise_on_tool(
        &self,
        tool_name: &str,
        context: &str,
        bundle: &MemoryBundle,
    ) -> Vec<Advice> {
        let mut candidates: Vec<(f64, Advice)> = Vec::new();

        for row in &bundle.evidence {
            let context_match = if context.trim().is_empty() {
                0.6
            } else {
                let overlap = keyword_overlap(context, &row.text).min(3) as f64;
                (0.5 + 0.12 * overlap).min(0.9)
            };
            let advice = Advice {
                advice_id: format!("adv_{}", &sha1_hex(&format!("{}:{}", row.source, row.id))[..10]),
                insight_key: insight_key_for(row.source, &row.id),
                text: row.text.clone(),
                confidence: row.confidence.clamp(0.0, 1.0),
                source: row.source,
                context_match,
                reason: format!("memory:{}", row.source),
                authority: None,
            };
            candidates.push((rank_score(&advice), advice));
        }

        for (tool, insight_key, text, confidence) in STATIC_RULES {
            if *tool != tool_name {
                continue;
            }
            let advice = Advice {
                advice_id: format!("adv_rule_{}", &sha1_hex(insight_key)[..8]),
                insight_key: (*insight_key).to_string(),
                text: (*text).to_string(),
                confidence: *confidence,
                source: AdviceSource::Advisor,
                context_match: 0.7,
                reason: "static_rule".to_string(),
                authority: None,
            };
            candidates.push((rank_score(&advice), advice));
        }

        candidates.retain(|(score, _)| *score >= self.cfg.min_rank_score);
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(self.cfg.max_items);
        debug!(
            tool = tool_name,
            count = candidates.len(),
            "live advisor ranked candidates"
        );
        candidates.into_iter().map(|(_, advice)| advice).collect()
    }

    /// Append an advice-request record, rate-limited per session/tool.
    /// Returns false when skipped by the rate limit.
    pub fn record_advice_request(&self, request: &AdviceRequest, min_interval_s: f64) -> bool {
        let state_path = self.home.feedback_state_file();
        let rate_key = format!("{}|{}", request.session_id, request.tool);
        let now = now_ts();

        let mut state = read_json_file(&state_path).unwrap_or_else(|| json!({}));
        let last = state
            .get("last_request")
            .and_then(|m| m.get(&rate_key))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if now - last < min_interval_s {
            return false;
        }

        let record = json!({
            "ts": now,
            "session_id": request.session_id,
            "tool": request.tool,
            "advice_ids": request.advice_ids,
            "advice_texts": request.advice_texts.iter()
                .map(|t| t.chars().take(200).collect::<String>())
                .collect::<Vec<_>>(),
            "sources": request.sources,
            "trace_id": request.trace_id,
            "route": request.route,
            "packet_id": request.packet_id,
        });
        if append_jsonl_capped(
            &self.home.feedback_requests_log(),
            &record,
            FEEDBACK_REQUESTS_MAX_LINES,
        )
        .is_err()
        {
            return false;
        }

        if !state.is_object() {
            state = json!({});
        }
        if state.get("last_request").map(|v| !v.is_object()).unwrap_or(true) {
            state["last_request"] = json!({});
        }
        state["last_request"][&rate_key] = json!(now);
        let _ = atomic_write_json(&state_path, &state);
        true
    }

    /// Most recent advice-request entry for a tool (and trace, if given).
    pub fn recent_advice_entry(&self, tool_name: &str, trace_id: Option<&str>) -> Option<Value> {
        let rows = tail_jsonl(&self.home.feedback_requests_log(), 50);
        rows.into_iter().rev().find(|row| {
            let tool_matches = row.get("tool").and_then(Value::as_str) == Some(tool_name);
            let trace_matches = match trace_id {
                Some(trace) => row.get("trace_id").and_then(Value::as_str) == Some(trace),
                None => true,
            };
            tool_matches && trace_matches
        })
    }

    /// Report an observed outcome for one advice id. Lands in the outcome
    /// log, so it feeds back into fusion on later hooks. `was_followed` is
    /// a heuristic, not a claim of causation.
    pub fn report_outcome(
        &self,
        advice_id: &str,
        was_followed: bool,
        was_helpful: bool,
        notes: &str,
        trace_id: Option<&str>,
    ) {
        let now = now_ts();
        let record = json!({
            "outcome_id": format!("out_{}", &sha1_hex(&format!("{advice_id}|{now:.6}"))[..10]),
            "event_type": "advice_outcome",
            "advice_id": advice_id,
            "polarity": if was_helpful { "pos" } else { "neg" },
            "text": notes,
            "was_followed": was_followed,
            "created_at": now,
            "trace_id": trace_id,
        });
        if let Err(e) =
            append_jsonl_capped(&self.home.outcomes_log(), &record, OUTCOMES_MAX_LINES)
        {
            debug!("outcome report append failed: {e}");
        }
    }
}

fn rank_score(advice: &Advice) -> f64 {
    0.5 * advice.confidence + 0.5 * advice.context_match
}
