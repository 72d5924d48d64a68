//! Runtime configuration (tuneables) for the advisory engine.
//!
//! A single JSON document at `<spark_home>/tuneables.json` holds one section
//! per subsystem. Sections are applied independently with clamping; unknown
//! keys are ignored with warnings, and out-of-range values clamp to the
//! documented ranges so a bad edit can never disable the engine. Writes go
//! through a lock file (5 s timeout, 30 s staleness eviction) because the
//! preferences flow and dashboards may edit the same document.

use crate::error::{Result, SparkError};
use crate::home::SparkHome;
use crate::jsonl::{atomic_write_json, read_json_file};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::warn;

const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_LOCK_POLL: Duration = Duration::from_millis(50);
const WRITE_LOCK_STALE_S: f64 = 30.0;

/// Outcome of applying one config section.
#[derive(Debug, Default, Clone)]
pub struct SectionApply {
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

impl SectionApply {
    fn merge(&mut self, other: SectionApply) {
        self.applied.extend(other.applied);
        self.warnings.extend(other.warnings);
    }
}

fn parse_bool(value: &Value, default: bool) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        _ => default,
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Engine orchestrator tuneables (`advisory_engine` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enabled: bool,
    pub max_ms: f64,
    pub include_mind: bool,
    pub prefetch_queue_enabled: bool,
    pub prefetch_inline_enabled: bool,
    pub prefetch_inline_max_jobs: u32,
    pub packet_fallback_emit_enabled: bool,
    /// Rolling window for the fallback rate guard.
    pub fallback_rate_guard_window_s: f64,
    /// Max fallback emissions inside the window before the guard trips.
    pub fallback_rate_guard_max_emits: usize,
    pub global_dedupe_enabled: bool,
    pub global_dedupe_text_enabled: bool,
    pub global_dedupe_cooldown_s: f64,
    /// `session` | `tree` | `global` — how widely the dedupe ledger applies.
    pub global_dedupe_scope: String,
    pub text_repeat_cooldown_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ms: 4000.0,
            include_mind: false,
            prefetch_queue_enabled: true,
            prefetch_inline_enabled: true,
            prefetch_inline_max_jobs: 1,
            packet_fallback_emit_enabled: true,
            fallback_rate_guard_window_s: 600.0,
            fallback_rate_guard_max_emits: 3,
            global_dedupe_enabled: true,
            global_dedupe_text_enabled: true,
            global_dedupe_cooldown_s: 600.0,
            global_dedupe_scope: "tree".to_string(),
            text_repeat_cooldown_s: 120.0,
        }
    }
}

impl EngineConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            match key.as_str() {
                "enabled" => {
                    self.enabled = parse_bool(value, self.enabled);
                    out.applied.push(key.clone());
                }
                "max_ms" => match parse_f64(value) {
                    Some(v) => {
                        self.max_ms = v.clamp(250.0, 20000.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_ms".to_string()),
                },
                "include_mind" => {
                    self.include_mind = parse_bool(value, self.include_mind);
                    out.applied.push(key.clone());
                }
                "prefetch_queue_enabled" => {
                    self.prefetch_queue_enabled = parse_bool(value, self.prefetch_queue_enabled);
                    out.applied.push(key.clone());
                }
                "prefetch_inline_enabled" => {
                    self.prefetch_inline_enabled = parse_bool(value, self.prefetch_inline_enabled);
                    out.applied.push(key.clone());
                }
                "prefetch_inline_max_jobs" => match parse_f64(value) {
                    Some(v) => {
                        self.prefetch_inline_max_jobs = (v as i64).clamp(1, 20) as u32;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_prefetch_inline_max_jobs".to_string()),
                },
                "packet_fallback_emit_enabled" => {
                    self.packet_fallback_emit_enabled =
                        parse_bool(value, self.packet_fallback_emit_enabled);
                    out.applied.push(key.clone());
                }
                "fallback_rate_guard_window_s" => match parse_f64(value) {
                    Some(v) => {
                        self.fallback_rate_guard_window_s = v.clamp(30.0, 86400.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_fallback_rate_guard_window_s".to_string()),
                },
                "fallback_rate_guard_max_emits" => match parse_f64(value) {
                    Some(v) => {
                        self.fallback_rate_guard_max_emits = (v as i64).clamp(1, 100) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_fallback_rate_guard_max_emits".to_string()),
                },
                "global_dedupe_enabled" => {
                    self.global_dedupe_enabled = parse_bool(value, self.global_dedupe_enabled);
                    out.applied.push(key.clone());
                }
                "global_dedupe_text_enabled" => {
                    self.global_dedupe_text_enabled =
                        parse_bool(value, self.global_dedupe_text_enabled);
                    out.applied.push(key.clone());
                }
                "global_dedupe_cooldown_s" => match parse_f64(value) {
                    Some(v) => {
                        self.global_dedupe_cooldown_s = v.clamp(0.0, 86400.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_global_dedupe_cooldown_s".to_string()),
                },
                "global_dedupe_scope" => {
                    let scope = value.as_str().unwrap_or("").trim().to_lowercase();
                    if matches!(scope.as_str(), "session" | "tree" | "global") {
                        self.global_dedupe_scope = scope;
                        out.applied.push(key.clone());
                    } else {
                        out.warnings.push("invalid_global_dedupe_scope".to_string());
                    }
                }
                "text_repeat_cooldown_s" => match parse_f64(value) {
                    Some(v) => {
                        self.text_repeat_cooldown_s = v.clamp(0.0, 86400.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_text_repeat_cooldown_s".to_string()),
                },
                other => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out
    }
}

/// Gate tuneables (`advisory_gate` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub max_emit_per_call: usize,
    pub tool_cooldown_s: f64,
    pub advice_repeat_cooldown_s: f64,
    pub warning_threshold: f64,
    pub note_threshold: f64,
    pub whisper_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_emit_per_call: 2,
            tool_cooldown_s: 45.0,
            advice_repeat_cooldown_s: 600.0,
            warning_threshold: 0.80,
            note_threshold: 0.50,
            whisper_threshold: 0.35,
        }
    }
}

impl GateConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            match key.as_str() {
                "max_emit_per_call" => match parse_f64(value) {
                    Some(v) => {
                        self.max_emit_per_call = (v as i64).clamp(1, 6) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_emit_per_call".to_string()),
                },
                "tool_cooldown_s" => match parse_f64(value) {
                    Some(v) => {
                        self.tool_cooldown_s = v.clamp(0.0, 3600.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_tool_cooldown_s".to_string()),
                },
                "advice_repeat_cooldown_s" => match parse_f64(value) {
                    Some(v) => {
                        self.advice_repeat_cooldown_s = v.clamp(30.0, 86400.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_advice_repeat_cooldown_s".to_string()),
                },
                "warning_threshold" => match parse_f64(value) {
                    Some(v) => {
                        self.warning_threshold = v.clamp(0.0, 1.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_warning_threshold".to_string()),
                },
                "note_threshold" => match parse_f64(value) {
                    Some(v) => {
                        self.note_threshold = v.clamp(0.0, 1.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_note_threshold".to_string()),
                },
                "whisper_threshold" => match parse_f64(value) {
                    Some(v) => {
                        self.whisper_threshold = v.clamp(0.0, 1.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_whisper_threshold".to_string()),
                },
                other => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out.merge(self.enforce_threshold_order());
        out
    }

    /// Thresholds must stay ordered `warning ≥ note ≥ whisper`. A config
    /// that violates this is clamped downward, never rejected.
    pub fn enforce_threshold_order(&mut self) -> SectionApply {
        let mut out = SectionApply::default();
        if self.note_threshold > self.warning_threshold {
            self.note_threshold = self.warning_threshold;
            out.warnings.push("note_threshold_clamped_to_warning".to_string());
        }
        if self.whisper_threshold > self.note_threshold {
            self.whisper_threshold = self.note_threshold;
            out.warnings.push("whisper_threshold_clamped_to_note".to_string());
        }
        out
    }
}

/// Packet store tuneables (`advisory_packet_store` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketStoreConfig {
    pub packet_ttl_s: f64,
    pub max_index_packets: usize,
    pub relaxed_effectiveness_weight: f64,
    pub relaxed_low_effectiveness_threshold: f64,
    pub relaxed_low_effectiveness_penalty: f64,
    pub relaxed_min_match_dimensions: usize,
    pub relaxed_min_match_score: f64,
    /// How many relaxed candidates to read fully before giving up.
    pub packet_lookup_candidates: usize,
}

impl Default for PacketStoreConfig {
    fn default() -> Self {
        Self {
            packet_ttl_s: 900.0,
            max_index_packets: 2000,
            relaxed_effectiveness_weight: 2.0,
            relaxed_low_effectiveness_threshold: 0.3,
            relaxed_low_effectiveness_penalty: 0.5,
            relaxed_min_match_dimensions: 1,
            relaxed_min_match_score: 3.0,
            packet_lookup_candidates: 6,
        }
    }
}

impl PacketStoreConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            let parsed = parse_f64(value);
            match (key.as_str(), parsed) {
                ("packet_ttl_s", Some(v)) => {
                    self.packet_ttl_s = v.clamp(30.0, 86400.0);
                    out.applied.push(key.clone());
                }
                ("max_index_packets", Some(v)) => {
                    self.max_index_packets = (v as i64).clamp(100, 50000) as usize;
                    out.applied.push(key.clone());
                }
                ("relaxed_effectiveness_weight", Some(v)) => {
                    self.relaxed_effectiveness_weight = v.clamp(0.0, 10.0);
                    out.applied.push(key.clone());
                }
                ("relaxed_low_effectiveness_threshold", Some(v)) => {
                    self.relaxed_low_effectiveness_threshold = v.clamp(0.0, 1.0);
                    out.applied.push(key.clone());
                }
                ("relaxed_low_effectiveness_penalty", Some(v)) => {
                    self.relaxed_low_effectiveness_penalty = v.clamp(0.0, 5.0);
                    out.applied.push(key.clone());
                }
                ("relaxed_min_match_dimensions", Some(v)) => {
                    self.relaxed_min_match_dimensions = (v as i64).clamp(0, 3) as usize;
                    out.applied.push(key.clone());
                }
                ("relaxed_min_match_score", Some(v)) => {
                    self.relaxed_min_match_score = v.clamp(0.0, 10.0);
                    out.applied.push(key.clone());
                }
                ("packet_lookup_candidates", Some(v)) => {
                    self.packet_lookup_candidates = (v as i64).clamp(1, 50) as usize;
                    out.applied.push(key.clone());
                }
                (
                    "packet_ttl_s" | "max_index_packets" | "relaxed_effectiveness_weight"
                    | "relaxed_low_effectiveness_threshold" | "relaxed_low_effectiveness_penalty"
                    | "relaxed_min_match_dimensions" | "relaxed_min_match_score"
                    | "packet_lookup_candidates",
                    None,
                ) => out.warnings.push(format!("invalid_{key}")),
                (other, _) => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out
    }
}

/// Prefetch worker tuneables (`advisory_prefetch` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    pub worker_enabled: bool,
    pub max_jobs_per_run: usize,
    pub max_tools_per_job: usize,
    pub min_probability: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            max_jobs_per_run: 3,
            max_tools_per_job: 3,
            min_probability: 0.25,
        }
    }
}

impl PrefetchConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            match key.as_str() {
                "worker_enabled" => {
                    self.worker_enabled = parse_bool(value, self.worker_enabled);
                    out.applied.push(key.clone());
                }
                "max_jobs_per_run" => match parse_f64(value) {
                    Some(v) => {
                        self.max_jobs_per_run = (v as i64).clamp(1, 50) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_jobs_per_run".to_string()),
                },
                "max_tools_per_job" => match parse_f64(value) {
                    Some(v) => {
                        self.max_tools_per_job = (v as i64).clamp(1, 10) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_tools_per_job".to_string()),
                },
                "min_probability" => match parse_f64(value) {
                    Some(v) => {
                        self.min_probability = v.clamp(0.0, 1.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_min_probability".to_string()),
                },
                other => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out
    }
}

/// Synthesizer composition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthMode {
    Auto,
    AiOnly,
    Programmatic,
}

impl SynthMode {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "auto" => Some(SynthMode::Auto),
            "ai_only" | "ai-only" => Some(SynthMode::AiOnly),
            "programmatic" => Some(SynthMode::Programmatic),
            _ => None,
        }
    }
}

/// Synthesizer tuneables (`synthesizer` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    pub mode: SynthMode,
    pub ai_timeout_s: f64,
    pub preferred_provider: String,
    pub cache_ttl_s: f64,
    pub max_cache_entries: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            mode: SynthMode::Auto,
            ai_timeout_s: 3.0,
            preferred_provider: "auto".to_string(),
            cache_ttl_s: 120.0,
            max_cache_entries: 50,
        }
    }
}

impl SynthesizerConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            match key.as_str() {
                "mode" => match SynthMode::parse(value.as_str().unwrap_or("")) {
                    Some(mode) => {
                        self.mode = mode;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_mode".to_string()),
                },
                "ai_timeout_s" => match parse_f64(value) {
                    Some(v) => {
                        self.ai_timeout_s = v.clamp(0.5, 30.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_ai_timeout_s".to_string()),
                },
                "preferred_provider" => {
                    self.preferred_provider = value
                        .as_str()
                        .unwrap_or("auto")
                        .trim()
                        .to_lowercase();
                    out.applied.push(key.clone());
                }
                "cache_ttl_s" => match parse_f64(value) {
                    Some(v) => {
                        self.cache_ttl_s = v.clamp(10.0, 3600.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_cache_ttl_s".to_string()),
                },
                "max_cache_entries" => match parse_f64(value) {
                    Some(v) => {
                        self.max_cache_entries = (v as i64).clamp(5, 500) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_cache_entries".to_string()),
                },
                other => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out
    }
}

/// Live-advisor tuneables (`advisor` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    pub max_items: usize,
    pub min_rank_score: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self { max_items: 8, min_rank_score: 0.55 }
    }
}

impl AdvisorConfig {
    pub fn apply(&mut self, cfg: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = cfg.as_object() else { return out };
        for (key, value) in obj {
            match key.as_str() {
                "max_items" => match parse_f64(value) {
                    Some(v) => {
                        self.max_items = (v as i64).clamp(1, 20) as usize;
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_max_items".to_string()),
                },
                "min_rank_score" => match parse_f64(value) {
                    Some(v) => {
                        self.min_rank_score = v.clamp(0.0, 1.0);
                        out.applied.push(key.clone());
                    }
                    None => out.warnings.push("invalid_min_rank_score".to_string()),
                },
                // Keys owned by the preferences derivation; accepted silently
                // so a round-tripped document does not warn about itself.
                "guidance_style" | "replay_mode" => out.applied.push(key.clone()),
                other => out.warnings.push(format!("unknown_key:{other}")),
            }
        }
        out
    }
}

/// Memory mode chosen in the preferences flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    Off,
    Standard,
    Replay,
}

impl MemoryMode {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "off" => MemoryMode::Off,
            "replay" => MemoryMode::Replay,
            _ => MemoryMode::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryMode::Off => "off",
            MemoryMode::Standard => "standard",
            MemoryMode::Replay => "replay",
        }
    }
}

/// Guidance style chosen in the preferences flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceStyle {
    Concise,
    Balanced,
    Coach,
}

impl GuidanceStyle {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "concise" => GuidanceStyle::Concise,
            "coach" => GuidanceStyle::Coach,
            _ => GuidanceStyle::Balanced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuidanceStyle::Concise => "concise",
            GuidanceStyle::Balanced => "balanced",
            GuidanceStyle::Coach => "coach",
        }
    }
}

/// User preferences (`advisory_preferences` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencesConfig {
    pub memory_mode: MemoryMode,
    pub guidance_style: GuidanceStyle,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            memory_mode: MemoryMode::Standard,
            guidance_style: GuidanceStyle::Balanced,
            source: String::new(),
            updated_at: String::new(),
        }
    }
}

/// Quality profile (`advisory_quality` section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    Balanced,
    Enhanced,
    Max,
}

impl QualityProfile {
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "enhanced" => QualityProfile::Enhanced,
            "max" => QualityProfile::Max,
            _ => QualityProfile::Balanced,
        }
    }

    /// Profile-derived synthesizer knobs.
    pub fn synth_overrides(&self) -> (SynthMode, f64) {
        match self {
            QualityProfile::Balanced => (SynthMode::Programmatic, 3.0),
            QualityProfile::Enhanced => (SynthMode::Auto, 6.0),
            QualityProfile::Max => (SynthMode::AiOnly, 8.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub profile: QualityProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_timeout_s: Option<f64>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self { profile: QualityProfile::Enhanced, preferred_provider: None, ai_timeout_s: None }
    }
}

/// The full section-keyed tuneables document.
#[derive(Debug, Clone, Default)]
pub struct Tuneables {
    pub advisor: AdvisorConfig,
    pub engine: EngineConfig,
    pub gate: GateConfig,
    pub packet_store: PacketStoreConfig,
    pub prefetch: PrefetchConfig,
    pub synthesizer: SynthesizerConfig,
    pub preferences: PreferencesConfig,
    pub quality: QualityConfig,
}

impl Tuneables {
    /// Load from `<spark_home>/tuneables.json`, starting from defaults.
    ///
    /// A missing or corrupt file yields pure defaults; section warnings are
    /// logged, never fatal.
    pub fn load(home: &SparkHome) -> Self {
        let mut tuneables = Self::default();
        if let Some(doc) = read_json_file(&home.tuneables_file()) {
            let report = tuneables.apply_document(&doc);
            for warning in &report.warnings {
                warn!(tuneable = %warning, "tuneables warning");
            }
        }
        tuneables
    }

    /// Apply every recognized section of a parsed tuneables document.
    pub fn apply_document(&mut self, doc: &Value) -> SectionApply {
        let mut out = SectionApply::default();
        let Some(obj) = doc.as_object() else { return out };
        for (section, value) in obj {
            match section.as_str() {
                "advisor" => out.merge(self.advisor.apply(value)),
                "advisory_engine" => out.merge(self.engine.apply(value)),
                "advisory_gate" => out.merge(self.gate.apply(value)),
                "advisory_packet_store" => out.merge(self.packet_store.apply(value)),
                "advisory_prefetch" => out.merge(self.prefetch.apply(value)),
                "synthesizer" => out.merge(self.synthesizer.apply(value)),
                "advisory_preferences" => {
                    let mode = value.get("memory_mode").and_then(Value::as_str).unwrap_or("");
                    let style = value.get("guidance_style").and_then(Value::as_str).unwrap_or("");
                    self.preferences.memory_mode = MemoryMode::parse(mode);
                    self.preferences.guidance_style = GuidanceStyle::parse(style);
                    if let Some(src) = value.get("source").and_then(Value::as_str) {
                        self.preferences.source = src.to_string();
                    }
                    if let Some(at) = value.get("updated_at").and_then(Value::as_str) {
                        self.preferences.updated_at = at.to_string();
                    }
                    self.derive_preferences();
                    out.applied.push("advisory_preferences".to_string());
                }
                "advisory_quality" => {
                    let profile = value.get("profile").and_then(Value::as_str).unwrap_or("");
                    self.quality.profile = QualityProfile::parse(profile);
                    self.quality.preferred_provider = value
                        .get("preferred_provider")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                    self.quality.ai_timeout_s =
                        value.get("ai_timeout_s").and_then(parse_f64);
                    self.derive_quality();
                    out.applied.push("advisory_quality".to_string());
                }
                other => out.warnings.push(format!("unknown_section:{other}")),
            }
        }
        out
    }

    /// Set preferences and re-derive advisor knobs. Idempotent: applying
    /// the same `(mode, style)` twice leaves the document unchanged.
    pub fn apply_preferences(&mut self, memory_mode: MemoryMode, style: GuidanceStyle) {
        self.preferences.memory_mode = memory_mode;
        self.preferences.guidance_style = style;
        self.preferences.source = "setup".to_string();
        self.preferences.updated_at = chrono::Utc::now().to_rfc3339();
        self.derive_preferences();
    }

    fn derive_preferences(&mut self) {
        let (max_items, min_rank_score) = match self.preferences.guidance_style {
            GuidanceStyle::Concise => (5, 0.60),
            GuidanceStyle::Balanced => (8, 0.55),
            GuidanceStyle::Coach => (10, 0.50),
        };
        self.advisor.max_items = max_items;
        self.advisor.min_rank_score = min_rank_score;
    }

    fn derive_quality(&mut self) {
        let (mode, timeout) = self.quality.profile.synth_overrides();
        self.synthesizer.mode = mode;
        self.synthesizer.ai_timeout_s = self.quality.ai_timeout_s.unwrap_or(timeout).clamp(0.5, 30.0);
        if let Some(provider) = &self.quality.preferred_provider {
            self.synthesizer.preferred_provider = provider.trim().to_lowercase();
        }
    }

    /// Render the document for persistence.
    pub fn to_document(&self) -> Value {
        json!({
            "advisor": {
                "max_items": self.advisor.max_items,
                "min_rank_score": self.advisor.min_rank_score,
                "guidance_style": self.preferences.guidance_style.as_str(),
                "replay_mode": self.preferences.memory_mode.as_str(),
            },
            "advisory_engine": self.engine,
            "advisory_gate": self.gate,
            "advisory_packet_store": self.packet_store,
            "advisory_prefetch": self.prefetch,
            "synthesizer": self.synthesizer,
            "advisory_preferences": {
                "memory_mode": self.preferences.memory_mode.as_str(),
                "guidance_style": self.preferences.guidance_style.as_str(),
                "source": self.preferences.source,
                "updated_at": self.preferences.updated_at,
            },
            "advisory_quality": self.quality,
        })
    }

    /// Persist under the write lock (temp file + rename inside).
    pub fn save(&self, home: &SparkHome) -> Result<()> {
        let path = home.tuneables_file();
        let lock_path = path.with_extension("json.lock");
        let _lock = FileLock::acquire(&lock_path)?;
        atomic_write_json(&path, &self.to_document())
    }
}

/// Exclusive-create lock file with staleness eviction.
struct FileLock {
    path: std::path::PathBuf,
}

impl FileLock {
    fn acquire(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + WRITE_LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = write!(file, "{} {}", std::process::id(), crate::util::now_ts());
                    return Ok(Self { path: path.to_path_buf() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = std::fs::metadata(path) {
                        if let Ok(modified) = meta.modified() {
                            let age = modified.elapsed().map(|d| d.as_secs_f64()).unwrap_or(0.0);
                            if age > WRITE_LOCK_STALE_S {
                                let _ = std::fs::remove_file(path);
                                continue;
                            }
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(SparkError::LockTimeout(path.display().to_string()));
                    }
                    std::thread::sleep(WRITE_LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Convenience for building a section payload in tests and CLI.
pub fn section_value(pairs: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_gate_apply_updates_runtime_values() {
        let mut cfg = GateConfig::default();
        let result = cfg.apply(&json!({
            "max_emit_per_call": 2,
            "tool_cooldown_s": 180,
            "advice_repeat_cooldown_s": 7200,
            "warning_threshold": 0.82,
            "note_threshold": 0.52,
            "whisper_threshold": 0.36,
        }));
        assert!(result.applied.contains(&"max_emit_per_call".to_string()));
        assert_eq!(cfg.tool_cooldown_s, 180.0);
        assert_eq!(cfg.advice_repeat_cooldown_s, 7200.0);
        assert_eq!(cfg.warning_threshold, 0.82);
        assert_eq!(cfg.note_threshold, 0.52);
        assert_eq!(cfg.whisper_threshold, 0.36);
    }

    #[test]
    fn test_gate_threshold_ordering_clamps_downward() {
        let mut cfg = GateConfig::default();
        let result = cfg.apply(&json!({
            "warning_threshold": 0.5,
            "note_threshold": 0.9,
            "whisper_threshold": 0.8,
        }));
        assert!(cfg.warning_threshold >= cfg.note_threshold);
        assert!(cfg.note_threshold >= cfg.whisper_threshold);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_engine_apply_clamps_max_ms() {
        let mut cfg = EngineConfig::default();
        cfg.apply(&json!({"max_ms": 50}));
        assert_eq!(cfg.max_ms, 250.0);
        cfg.apply(&json!({"max_ms": 99999}));
        assert_eq!(cfg.max_ms, 20000.0);
    }

    #[test]
    fn test_unknown_keys_warn_but_do_not_fail() {
        let mut cfg = EngineConfig::default();
        let result = cfg.apply(&json!({"enabled": false, "bogus_key": 1}));
        assert!(!cfg.enabled);
        assert!(result.warnings.iter().any(|w| w.contains("bogus_key")));
    }

    #[test]
    fn test_packet_store_apply_updates_defaults() {
        let mut cfg = PacketStoreConfig::default();
        let result = cfg.apply(&json!({
            "packet_ttl_s": 1800,
            "max_index_packets": 3500,
            "relaxed_effectiveness_weight": 3.0,
        }));
        assert!(result.applied.contains(&"packet_ttl_s".to_string()));
        assert_eq!(cfg.packet_ttl_s, 1800.0);
        assert_eq!(cfg.max_index_packets, 3500);
        assert_eq!(cfg.relaxed_effectiveness_weight, 3.0);
        assert_eq!(cfg.packet_lookup_candidates, 6);
    }

    #[test]
    fn test_apply_preferences_is_idempotent() {
        let mut a = Tuneables::default();
        a.apply_preferences(MemoryMode::Replay, GuidanceStyle::Concise);
        let first = (a.advisor.max_items, a.advisor.min_rank_score);
        a.apply_preferences(MemoryMode::Replay, GuidanceStyle::Concise);
        assert_eq!(first, (a.advisor.max_items, a.advisor.min_rank_score));
        assert_eq!(a.advisor.max_items, 5);
        assert!((a.advisor.min_rank_score - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_quality_profile_derives_synth_mode() {
        let mut t = Tuneables::default();
        t.apply_document(&json!({"advisory_quality": {"profile": "max"}}));
        assert_eq!(t.synthesizer.mode, SynthMode::AiOnly);
        assert_eq!(t.synthesizer.ai_timeout_s, 8.0);
        t.apply_document(&json!({"advisory_quality": {"profile": "balanced"}}));
        assert_eq!(t.synthesizer.mode, SynthMode::Programmatic);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path());
        let mut t = Tuneables::default();
        t.apply_document(&json!({
            "advisory_gate": {"max_emit_per_call": 3},
            "advisory_engine": {"max_ms": 2500},
        }));
        t.save(&home).unwrap();

        let back = Tuneables::load(&home);
        assert_eq!(back.gate.max_emit_per_call, 3);
        assert_eq!(back.engine.max_ms, 2500.0);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path());
        let t = Tuneables::load(&home);
        assert_eq!(t.gate.max_emit_per_call, 2);
        assert_eq!(t.packet_store.packet_ttl_s, 900.0);
    }

    #[test]
    fn test_file_lock_blocks_second_acquire() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("tuneables.json.lock");
        let first = FileLock::acquire(&lock_path).unwrap();
        // Second acquire in the same process should fail after timing out;
        // use a raw create_new probe to avoid waiting the full 5 s.
        assert!(std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .is_err());
        drop(first);
        assert!(!lock_path.exists());
    }
}
