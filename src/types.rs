//! Core data types for the advisory engine
//!
//! This module defines the structures shared across the pipeline: advice
//! candidates, gate decisions, packets, and the closed intent/plane/phase
//! taxonomies. These types form the wire and disk schema of the engine, so
//! every optional field decodes with a default for backwards compatibility.

use crate::util::now_ts;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Implements the `Display` body by delegating to `as_str` (shared by the
/// closed-set enums below).
macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

/// Graduated salience level assigned to an advisory.
///
/// Ordering matters: `Warning > Note > Whisper > Silent`, both for the
/// emitter's format selection and the gate's emit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Silent,
    Whisper,
    Note,
    Warning,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Silent => "silent",
            Authority::Whisper => "whisper",
            Authority::Note => "note",
            Authority::Warning => "warning",
        }
    }

    /// Only NOTE and WARNING reach the host.
    pub fn emits(&self) -> bool {
        matches!(self, Authority::Note | Authority::Warning)
    }
}

impl fmt::Display for Authority {
    fmt_as_str!();
}

/// Where a piece of advice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    Cognitive,
    Eidos,
    Chips,
    Outcomes,
    Orchestration,
    Mind,
    Baseline,
    Prefetch,
    Bank,
    Advisor,
    Packet,
}

impl AdviceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdviceSource::Cognitive => "cognitive",
            AdviceSource::Eidos => "eidos",
            AdviceSource::Chips => "chips",
            AdviceSource::Outcomes => "outcomes",
            AdviceSource::Orchestration => "orchestration",
            AdviceSource::Mind => "mind",
            AdviceSource::Baseline => "baseline",
            AdviceSource::Prefetch => "prefetch",
            AdviceSource::Bank => "bank",
            AdviceSource::Advisor => "advisor",
            AdviceSource::Packet => "packet",
        }
    }

    /// Lenient parse used when decoding persisted rows; unknown tags fall
    /// back to `Advisor` rather than failing the whole packet.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "cognitive" => AdviceSource::Cognitive,
            "eidos" => AdviceSource::Eidos,
            "chips" => AdviceSource::Chips,
            "outcomes" => AdviceSource::Outcomes,
            "orchestration" => AdviceSource::Orchestration,
            "mind" => AdviceSource::Mind,
            "baseline" => AdviceSource::Baseline,
            "prefetch" => AdviceSource::Prefetch,
            "bank" => AdviceSource::Bank,
            "packet" => AdviceSource::Packet,
            _ => AdviceSource::Advisor,
        }
    }
}

impl fmt::Display for AdviceSource {
    fmt_as_str!();
}

/// A candidate piece of guidance flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advice {
    /// Stable identifier within a run
    pub advice_id: String,

    /// Category-prefixed identifier, e.g. `wisdom:pool_size`
    #[serde(default)]
    pub insight_key: String,

    pub text: String,

    /// Confidence in [0, 1]
    pub confidence: f64,

    pub source: AdviceSource,

    /// How well the advice matches the current context, in [0, 1]
    #[serde(default)]
    pub context_match: f64,

    #[serde(default)]
    pub reason: String,

    /// Transient authority assigned by the gate; never persisted.
    #[serde(skip)]
    pub authority: Option<Authority>,
}

impl Advice {
    /// Advice category: the `insight_key` prefix before `:`, falling back
    /// to a source-derived category when no key is present.
    pub fn category(&self) -> &str {
        if let Some(idx) = self.insight_key.find(':') {
            let prefix = &self.insight_key[..idx];
            if !prefix.is_empty() {
                return prefix;
            }
        }
        match self.source {
            AdviceSource::Cognitive | AdviceSource::Eidos => "wisdom",
            AdviceSource::Outcomes => "history",
            AdviceSource::Chips | AdviceSource::Orchestration | AdviceSource::Mind => "context",
            _ => self.source.as_str(),
        }
    }
}

/// Per-candidate outcome of gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub advice_id: String,
    pub authority: Authority,
    pub emit: bool,
    pub reason: String,
    pub adjusted_score: f64,
    pub original_score: f64,
}

/// Result of one gate pass over a candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: TaskPhase,
    pub total_retrieved: usize,
    pub decisions: Vec<GateDecision>,
    /// Ordered by adjusted score, capped at the per-call budget.
    pub emitted: Vec<GateDecision>,
    pub suppressed: Vec<GateDecision>,
}

impl GateResult {
    pub fn empty(phase: TaskPhase) -> Self {
        Self {
            phase,
            total_retrieved: 0,
            decisions: Vec::new(),
            emitted: Vec::new(),
            suppressed: Vec::new(),
        }
    }

    /// Highest authority present among emitted decisions.
    pub fn top_authority(&self) -> Authority {
        self.emitted
            .iter()
            .map(|d| d.authority)
            .max()
            .unwrap_or(Authority::Silent)
    }
}

/// Inferred activity mode of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Exploration,
    Planning,
    Implementation,
    Testing,
    Debugging,
    Deployment,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Exploration => "exploration",
            TaskPhase::Planning => "planning",
            TaskPhase::Implementation => "implementation",
            TaskPhase::Testing => "testing",
            TaskPhase::Debugging => "debugging",
            TaskPhase::Deployment => "deployment",
        }
    }
}

impl Default for TaskPhase {
    fn default() -> Self {
        TaskPhase::Exploration
    }
}

impl fmt::Display for TaskPhase {
    fmt_as_str!();
}

/// Closed set of 12 intent families assigned to user prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentFamily {
    AuthSecurity,
    DeploymentOps,
    TestingValidation,
    SchemaContracts,
    PerformanceLatency,
    ToolReliability,
    KnowledgeAlignment,
    TeamCoordination,
    OrchestrationExecution,
    StakeholderAlignment,
    ResearchDecisionSupport,
    EmergentOther,
}

impl IntentFamily {
    pub const ALL: [IntentFamily; 12] = [
        IntentFamily::AuthSecurity,
        IntentFamily::DeploymentOps,
        IntentFamily::TestingValidation,
        IntentFamily::SchemaContracts,
        IntentFamily::PerformanceLatency,
        IntentFamily::ToolReliability,
        IntentFamily::KnowledgeAlignment,
        IntentFamily::TeamCoordination,
        IntentFamily::OrchestrationExecution,
        IntentFamily::StakeholderAlignment,
        IntentFamily::ResearchDecisionSupport,
        IntentFamily::EmergentOther,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentFamily::AuthSecurity => "auth_security",
            IntentFamily::DeploymentOps => "deployment_ops",
            IntentFamily::TestingValidation => "testing_validation",
            IntentFamily::SchemaContracts => "schema_contracts",
            IntentFamily::PerformanceLatency => "performance_latency",
            IntentFamily::ToolReliability => "tool_reliability",
            IntentFamily::KnowledgeAlignment => "knowledge_alignment",
            IntentFamily::TeamCoordination => "team_coordination",
            IntentFamily::OrchestrationExecution => "orchestration_execution",
            IntentFamily::StakeholderAlignment => "stakeholder_alignment",
            IntentFamily::ResearchDecisionSupport => "research_decision_support",
            IntentFamily::EmergentOther => "emergent_other",
        }
    }

    pub fn parse(tag: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == tag.trim())
            .unwrap_or(IntentFamily::EmergentOther)
    }

    /// Each intent family maps to exactly one task plane.
    pub fn plane(&self) -> TaskPlane {
        match self {
            IntentFamily::TeamCoordination | IntentFamily::StakeholderAlignment => {
                TaskPlane::TeamManagement
            }
            IntentFamily::OrchestrationExecution => TaskPlane::OrchestrationExecution,
            IntentFamily::ResearchDecisionSupport => TaskPlane::ResearchDecision,
            _ => TaskPlane::BuildDelivery,
        }
    }
}

impl Default for IntentFamily {
    fn default() -> Self {
        IntentFamily::EmergentOther
    }
}

impl fmt::Display for IntentFamily {
    fmt_as_str!();
}

/// Closed set of 4 task planes derived from intent families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPlane {
    BuildDelivery,
    TeamManagement,
    OrchestrationExecution,
    ResearchDecision,
}

impl TaskPlane {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPlane::BuildDelivery => "build_delivery",
            TaskPlane::TeamManagement => "team_management",
            TaskPlane::OrchestrationExecution => "orchestration_execution",
            TaskPlane::ResearchDecision => "research_decision",
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag.trim() {
            "team_management" => TaskPlane::TeamManagement,
            "orchestration_execution" => TaskPlane::OrchestrationExecution,
            "research_decision" => TaskPlane::ResearchDecision,
            _ => TaskPlane::BuildDelivery,
        }
    }
}

impl Default for TaskPlane {
    fn default() -> Self {
        TaskPlane::BuildDelivery
    }
}

impl fmt::Display for TaskPlane {
    fmt_as_str!();
}

/// How a packet's advisory text was composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    BaselineDeterministic,
    PrefetchDeterministic,
    LiveDeterministic,
    LiveAi,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::BaselineDeterministic => "baseline_deterministic",
            SourceMode::PrefetchDeterministic => "prefetch_deterministic",
            SourceMode::LiveDeterministic => "live_deterministic",
            SourceMode::LiveAi => "live_ai",
        }
    }
}

impl fmt::Display for SourceMode {
    fmt_as_str!();
}

/// Normalized advice row persisted inside a packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceRow {
    pub advice_id: String,
    #[serde(default)]
    pub insight_key: String,
    pub text: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_context_match")]
    pub context_match: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_context_match() -> f64 {
    0.5
}

impl AdviceRow {
    pub fn from_advice(item: &Advice) -> Self {
        Self {
            advice_id: item.advice_id.clone(),
            insight_key: item.insight_key.clone(),
            text: item.text.clone(),
            confidence: item.confidence,
            source: item.source.as_str().to_string(),
            context_match: item.context_match,
            reason: item.reason.clone(),
        }
    }
}

/// Provenance of a packet's composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lineage {
    pub sources: Vec<String>,
    pub memory_absent_declared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch_job_id: Option<String>,
}

/// Last explicit or implicit feedback applied to a packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketFeedback {
    pub helpful: Option<bool>,
    pub noisy: bool,
    pub followed: bool,
    pub source: String,
    pub ts: f64,
}

/// A cached, content-addressed advisory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub packet_id: String,
    pub project_key: String,
    pub session_context_key: String,
    pub tool_name: String,
    pub intent_family: IntentFamily,
    pub task_plane: TaskPlane,
    pub advisory_text: String,
    pub source_mode: SourceMode,
    #[serde(default)]
    pub advice_items: Vec<AdviceRow>,
    pub lineage: Lineage,
    pub created_ts: f64,
    pub updated_ts: f64,
    pub fresh_until_ts: f64,
    #[serde(default)]
    pub invalidated: bool,
    #[serde(default)]
    pub invalidate_reason: String,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub emit_count: u64,
    #[serde(default)]
    pub helpful_count: u64,
    #[serde(default)]
    pub unhelpful_count: u64,
    #[serde(default)]
    pub noisy_count: u64,
    #[serde(default)]
    pub feedback_count: u64,
    #[serde(default = "default_effectiveness")]
    pub effectiveness_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_ts: Option<f64>,
    #[serde(default)]
    pub last_route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<PacketFeedback>,
}

fn default_effectiveness() -> f64 {
    0.5
}

impl Packet {
    /// A packet is fresh iff not invalidated and its TTL has not lapsed.
    pub fn is_fresh(&self, now: f64) -> bool {
        !self.invalidated && self.fresh_until_ts >= now
    }

    /// Bounded Bayesian effectiveness estimate with a neutral prior,
    /// penalized by noisy reports. Clamped to [0.05, 0.99].
    pub fn compute_effectiveness(helpful: u64, unhelpful: u64, noisy: u64) -> f64 {
        let good = helpful as f64 + 1.0;
        let bad = unhelpful as f64 + 1.0;
        let mut score = good / (good + bad).max(1.0);
        score -= (noisy as f64 * 0.05).min(0.35);
        score.clamp(0.05, 0.99)
    }

    /// Recompute counters-derived fields after any mutation.
    pub fn normalize(&mut self) {
        self.effectiveness_score = Self::compute_effectiveness(
            self.helpful_count,
            self.unhelpful_count,
            self.noisy_count,
        );
    }

    /// Materialize this packet's rows as live advice candidates.
    ///
    /// Falls back to a single candidate built from the advisory text when
    /// no rows were persisted.
    pub fn to_advice(&self, max_rows: usize) -> Vec<Advice> {
        let mut out = Vec::new();
        for row in self.advice_items.iter().take(max_rows) {
            let text = row.text.trim();
            if text.is_empty() {
                continue;
            }
            out.push(Advice {
                advice_id: if row.advice_id.is_empty() {
                    format!("{}_item_{}", self.packet_id, out.len())
                } else {
                    row.advice_id.clone()
                },
                insight_key: if row.insight_key.is_empty() {
                    self.packet_id.clone()
                } else {
                    row.insight_key.clone()
                },
                text: text.to_string(),
                confidence: if row.confidence > 0.0 { row.confidence } else { 0.6 },
                source: AdviceSource::parse(&row.source),
                context_match: if row.context_match > 0.0 { row.context_match } else { 0.8 },
                reason: row.reason.clone(),
                authority: None,
            });
        }
        if !out.is_empty() {
            return out;
        }
        let text = self.advisory_text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        vec![Advice {
            advice_id: format!("{}_fallback", self.packet_id),
            insight_key: self.packet_id.clone(),
            text: text.to_string(),
            confidence: 0.7,
            source: AdviceSource::Packet,
            context_match: 0.8,
            reason: "packet_cached_advisory".to_string(),
            authority: None,
        }]
    }

    /// Timestamp of creation as a UTC datetime (status surfaces only).
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.created_ts as i64, 0)
    }
}

/// Subset of packet fields mirrored into the on-disk index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketMeta {
    pub project_key: String,
    pub session_context_key: String,
    pub tool_name: String,
    pub intent_family: IntentFamily,
    pub task_plane: TaskPlane,
    pub updated_ts: f64,
    pub fresh_until_ts: f64,
    #[serde(default)]
    pub invalidated: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub emit_count: u64,
    #[serde(default)]
    pub helpful_count: u64,
    #[serde(default)]
    pub unhelpful_count: u64,
    #[serde(default)]
    pub noisy_count: u64,
    #[serde(default)]
    pub feedback_count: u64,
    #[serde(default = "default_effectiveness")]
    pub effectiveness_score: f64,
}

impl PacketMeta {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            project_key: packet.project_key.clone(),
            session_context_key: packet.session_context_key.clone(),
            tool_name: packet.tool_name.clone(),
            intent_family: packet.intent_family,
            task_plane: packet.task_plane,
            updated_ts: packet.updated_ts,
            fresh_until_ts: packet.fresh_until_ts,
            invalidated: packet.invalidated,
            usage_count: packet.usage_count,
            emit_count: packet.emit_count,
            helpful_count: packet.helpful_count,
            unhelpful_count: packet.unhelpful_count,
            noisy_count: packet.noisy_count,
            feedback_count: packet.feedback_count,
            effectiveness_score: packet.effectiveness_score,
        }
    }

    pub fn is_fresh(&self, now: f64) -> bool {
        !self.invalidated && self.fresh_until_ts >= now
    }
}

/// Queued prefetch intent, one JSONL line per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchJob {
    #[serde(default)]
    pub job_id: String,
    pub session_id: String,
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub intent_family: IntentFamily,
    #[serde(default)]
    pub task_plane: TaskPlane,
    #[serde(default)]
    pub session_context_key: String,
    #[serde(default)]
    pub prompt_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default = "now_ts")]
    pub created_ts: f64,
    #[serde(default = "default_job_status")]
    pub status: String,
}

fn default_job_status() -> String {
    "queued".to_string()
}
