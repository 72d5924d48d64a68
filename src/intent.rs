//! Deterministic intent taxonomy mapper for advisory routing.
//!
//! Maps free prompt text plus the invoking tool onto a fixed set of intent
//! families and task planes. Pure function of its inputs: no wall-clock, no
//! randomness, stable tie-breaks, so identical sessions produce identical
//! packet keys across processes.

use crate::types::{IntentFamily, TaskPlane};
use crate::util::sha1_hex;
use serde::{Deserialize, Serialize};

/// Per-family keyword lexicon. Substring matches against the normalized
/// prompt; each hit counts once.
const INTENT_KEYWORDS: &[(IntentFamily, &[&str])] = &[
    (
        IntentFamily::AuthSecurity,
        &[
            "auth", "jwt", "token", "secret", "credential", "oauth", "permission", "secure",
            "security", "redact", "sanitize",
        ],
    ),
    (
        IntentFamily::DeploymentOps,
        &[
            "deploy", "release", "ship", "prod", "production", "rollback", "migration", "infra",
            "docker", "kubernetes", "ci", "cd",
        ],
    ),
    (
        IntentFamily::TestingValidation,
        &[
            "test", "pytest", "unit test", "integration test", "validate", "assert", "coverage",
            "regression",
        ],
    ),
    (
        IntentFamily::SchemaContracts,
        &["schema", "contract", "interface", "api", "payload", "json", "protobuf", "migration"],
    ),
    (
        IntentFamily::PerformanceLatency,
        &[
            "latency", "performance", "slow", "optimize", "throughput", "budget", "timeout",
            "p95", "cache",
        ],
    ),
    (
        IntentFamily::ToolReliability,
        &["error", "failing", "failed", "flake", "retry", "debug", "crash", "bug", "stability"],
    ),
    (
        IntentFamily::KnowledgeAlignment,
        &[
            "document", "docs", "guideline", "knowledge", "memory", "alignment", "consistency",
            "playbook",
        ],
    ),
    (
        IntentFamily::TeamCoordination,
        &[
            "team", "handoff", "owner", "coordination", "delegate", "staffing", "manager",
            "sync", "collaboration",
        ],
    ),
    (
        IntentFamily::OrchestrationExecution,
        &[
            "orchestrate", "workflow", "pipeline", "dependency", "sequence", "scheduler",
            "queue", "milestone",
        ],
    ),
    (
        IntentFamily::StakeholderAlignment,
        &[
            "stakeholder", "customer", "roadmap", "priority", "expectation", "status update",
            "reporting",
        ],
    ),
    (
        IntentFamily::ResearchDecisionSupport,
        &[
            "research", "evaluate", "compare", "benchmark", "analysis", "tradeoff", "decision",
            "option",
        ],
    ),
];

/// Tool → likely-intent hint; the matching family gets a +1 bonus.
const TOOL_INTENT_HINTS: &[(&str, IntentFamily)] = &[
    ("Edit", IntentFamily::ToolReliability),
    ("Write", IntentFamily::ToolReliability),
    ("Bash", IntentFamily::OrchestrationExecution),
    ("Read", IntentFamily::KnowledgeAlignment),
    ("Grep", IntentFamily::KnowledgeAlignment),
    ("Glob", IntentFamily::KnowledgeAlignment),
    ("WebSearch", IntentFamily::ResearchDecisionSupport),
    ("WebFetch", IntentFamily::ResearchDecisionSupport),
];

/// One ranked candidate family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub intent_family: IntentFamily,
    pub score: u32,
    pub confidence: f64,
    pub task_plane: TaskPlane,
}

/// One ranked task plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneCandidate {
    pub task_plane: TaskPlane,
    pub confidence: f64,
}

/// Classification result for one prompt/tool pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent_family: IntentFamily,
    pub confidence: f64,
    pub reason: String,
    pub task_plane: TaskPlane,
    /// Up to two ranked planes.
    pub task_planes: Vec<PlaneCandidate>,
    /// Up to three scored candidates.
    pub candidates: Vec<IntentCandidate>,
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn match_count(text: &str, keywords: &[&str]) -> u32 {
    keywords
        .iter()
        .filter(|kw| {
            let token = kw.trim().to_lowercase();
            !token.is_empty() && text.contains(&token)
        })
        .count() as u32
}

fn tool_hint(tool_name: &str) -> Option<IntentFamily> {
    TOOL_INTENT_HINTS
        .iter()
        .find(|(tool, _)| *tool == tool_name.trim())
        .map(|(_, family)| *family)
}

fn rank_intents(text: &str, tool_name: &str) -> Vec<(IntentFamily, u32)> {
    let hint = tool_hint(tool_name);
    let mut ranked: Vec<(IntentFamily, u32)> = INTENT_KEYWORDS
        .iter()
        .map(|(family, keywords)| {
            let mut score = match_count(text, keywords);
            if hint == Some(*family) {
                score += 1;
            }
            (*family, score)
        })
        .collect();
    // Stable tie-break: score descending, family name ascending.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
    ranked
}

fn confidence_from_score(score: u32) -> f64 {
    if score == 0 {
        return 0.2;
    }
    (0.3 + 0.12 * score as f64).min(0.95)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Deterministically map free text into a fixed intent family plus planes.
pub fn map_intent(prompt_text: &str, tool_name: &str) -> IntentResult {
    let text = normalize_text(prompt_text);
    let ranked = rank_intents(&text, tool_name);
    let (mut best_intent, best_score) = ranked.first().copied().unwrap_or((IntentFamily::EmergentOther, 0));
    if best_score == 0 {
        best_intent = IntentFamily::EmergentOther;
    }

    let mut candidates: Vec<IntentCandidate> = ranked
        .iter()
        .take(3)
        .filter(|(_, score)| *score > 0)
        .map(|(family, score)| IntentCandidate {
            intent_family: *family,
            score: *score,
            confidence: round3(confidence_from_score(*score)),
            task_plane: family.plane(),
        })
        .collect();
    if candidates.is_empty() {
        candidates.push(IntentCandidate {
            intent_family: IntentFamily::EmergentOther,
            score: 0,
            confidence: 0.2,
            task_plane: TaskPlane::BuildDelivery,
        });
    }

    // Rank planes by summing the scores of their winning families.
    let mut plane_scores: Vec<(TaskPlane, u32)> = Vec::new();
    for candidate in &candidates {
        match plane_scores.iter_mut().find(|(plane, _)| *plane == candidate.task_plane) {
            Some(entry) => entry.1 += candidate.score,
            None => plane_scores.push((candidate.task_plane, candidate.score)),
        }
    }
    plane_scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
    let task_planes: Vec<PlaneCandidate> = plane_scores
        .iter()
        .take(2)
        .map(|(plane, score)| PlaneCandidate {
            task_plane: *plane,
            confidence: round3(confidence_from_score(*score)),
        })
        .collect();
    let primary_plane = task_planes
        .first()
        .map(|p| p.task_plane)
        .unwrap_or(TaskPlane::BuildDelivery);

    IntentResult {
        intent_family: best_intent,
        confidence: round3(confidence_from_score(best_score)),
        reason: if best_score > 0 { "keyword_match" } else { "fallback" }.to_string(),
        task_plane: primary_plane,
        task_planes,
        candidates,
    }
}

/// Stable-ish volatile context signature for packet keying.
///
/// Deliberately changes when the recent tool sequence changes.
pub fn build_session_context_key(
    task_phase: &str,
    intent_family: IntentFamily,
    tool_name: &str,
    recent_tools: &[String],
) -> String {
    let phase = if task_phase.trim().is_empty() { "exploration" } else { task_phase.trim() };
    let tool = if tool_name.trim().is_empty() { "*" } else { tool_name.trim() };
    let window = recent_tools
        .iter()
        .rev()
        .take(5)
        .rev()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let raw = format!("{phase}|{}|{tool}|{window}", intent_family.as_str());
    sha1_hex(&raw)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_mapping_is_deterministic() {
        let prompt = "Harden JWT auth and redact tokens from logs.";
        let one = map_intent(prompt, "Edit");
        let two = map_intent(prompt, "Edit");
        assert_eq!(one.intent_family, two.intent_family);
        assert_eq!(one.confidence, two.confidence);
        assert_eq!(one.intent_family, IntentFamily::AuthSecurity);
        assert_eq!(one.task_plane, TaskPlane::BuildDelivery);
        assert_eq!(one.reason, "keyword_match");
    }

    #[test]
    fn test_intent_mapping_fallback() {
        let result = map_intent("do the thing maybe", "Read");
        // "Read" carries a knowledge_alignment hint, so either that family
        // wins on the bonus or everything scores zero.
        assert!(matches!(
            result.intent_family,
            IntentFamily::KnowledgeAlignment | IntentFamily::EmergentOther
        ));
    }

    #[test]
    fn test_zero_score_yields_fallback_confidence() {
        let result = map_intent("zzz qqq", "");
        assert_eq!(result.intent_family, IntentFamily::EmergentOther);
        assert_eq!(result.confidence, 0.2);
        assert_eq!(result.reason, "fallback");
    }

    #[test]
    fn test_confidence_formula() {
        assert_eq!(confidence_from_score(0), 0.2);
        assert!((confidence_from_score(1) - 0.42).abs() < 1e-9);
        assert!((confidence_from_score(2) - 0.54).abs() < 1e-9);
        // Saturates at 0.95.
        assert_eq!(confidence_from_score(10), 0.95);
    }

    #[test]
    fn test_ranked_planes_max_two() {
        let prompt = "Compare benchmark options and coordinate team handoff next.";
        let result = map_intent(prompt, "WebSearch");
        assert!(!result.task_planes.is_empty());
        assert!(result.task_planes.len() <= 2);
        assert!(result.candidates.len() <= 3);
    }

    #[test]
    fn test_tool_hint_breaks_tie() {
        // No keywords match; the hint should decide.
        let result = map_intent("", "Bash");
        assert_eq!(result.intent_family, IntentFamily::OrchestrationExecution);
    }

    #[test]
    fn test_tie_break_is_alphabetical() {
        // "migration" hits both deployment_ops and schema_contracts; with
        // equal scores deployment_ops wins on name order.
        let result = map_intent("migration", "");
        assert_eq!(result.intent_family, IntentFamily::DeploymentOps);
    }

    #[test]
    fn test_session_context_key_changes_with_recent_tools() {
        let a = build_session_context_key(
            "implementation",
            IntentFamily::AuthSecurity,
            "Edit",
            &["Read".to_string(), "Edit".to_string()],
        );
        let b = build_session_context_key(
            "implementation",
            IntentFamily::AuthSecurity,
            "Edit",
            &["Read".to_string(), "Bash".to_string()],
        );
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_session_context_key_stable_for_same_inputs() {
        let tools = vec!["Read".to_string(); 7];
        let a = build_session_context_key("testing", IntentFamily::TestingValidation, "Bash", &tools);
        let b = build_session_context_key("testing", IntentFamily::TestingValidation, "Bash", &tools);
        assert_eq!(a, b);
    }
}
