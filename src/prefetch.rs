//! Prefetch worker: turns queued user-prompt intents into predicted
//! packets before the tools actually run.
//!
//! The queue is an append-only JSONL file written by the engine on
//! `user_prompt`; the worker reads pending jobs (ids not yet in its
//! processed set), plans a few likely-next tools per job, and saves a
//! `prefetch_deterministic` packet per plan. Worker state (processed ids,
//! pause flag, last result) lives in its own JSON document.

use crate::config::PrefetchConfig;
use crate::home::SparkHome;
use crate::jsonl::{atomic_write_json, read_json_file, read_jsonl};
use crate::store::{PacketDraft, PacketStore};
use crate::types::{AdviceRow, IntentFamily, Lineage, PrefetchJob, SourceMode};
use crate::util::now_ts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const PROCESSED_MAX: usize = 4000;

/// One planned prefetch target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchPlan {
    pub project_key: String,
    pub session_context_key: String,
    pub tool_name: String,
    pub intent_family: IntentFamily,
    pub task_plane: crate::types::TaskPlane,
    pub probability: f64,
}

/// Likely-next tools per intent family, with calibrated probabilities.
fn likely_tools(intent_family: IntentFamily) -> &'static [(&'static str, f64)] {
    match intent_family {
        IntentFamily::AuthSecurity => &[("Edit", 0.6), ("Read", 0.5), ("Bash", 0.35)],
        IntentFamily::DeploymentOps => &[("Bash", 0.65), ("Read", 0.4), ("Edit", 0.35)],
        IntentFamily::TestingValidation => &[("Bash", 0.6), ("Edit", 0.45), ("Read", 0.35)],
        IntentFamily::SchemaContracts => &[("Edit", 0.55), ("Read", 0.5), ("Grep", 0.3)],
        IntentFamily::PerformanceLatency => &[("Bash", 0.5), ("Edit", 0.45), ("Read", 0.4)],
        IntentFamily::ToolReliability => &[("Edit", 0.6), ("Read", 0.5), ("Bash", 0.4)],
        IntentFamily::KnowledgeAlignment => &[("Read", 0.65), ("Grep", 0.45), ("Edit", 0.3)],
        IntentFamily::TeamCoordination => &[("Task", 0.5), ("Read", 0.35)],
        IntentFamily::OrchestrationExecution => &[("Bash", 0.6), ("Task", 0.4), ("Read", 0.3)],
        IntentFamily::StakeholderAlignment => &[("Read", 0.4), ("Write", 0.3)],
        IntentFamily::ResearchDecisionSupport => {
            &[("WebSearch", 0.6), ("WebFetch", 0.45), ("Read", 0.35)]
        }
        IntentFamily::EmergentOther => &[("Read", 0.5), ("Bash", 0.35), ("Edit", 0.3)],
    }
}

/// Deterministic per-job planner.
pub fn plan_prefetch_jobs(
    job: &PrefetchJob,
    max_tools: usize,
    min_probability: f64,
) -> Vec<PrefetchPlan> {
    likely_tools(job.intent_family)
        .iter()
        .filter(|(_, probability)| *probability >= min_probability)
        .take(max_tools)
        .map(|(tool, probability)| PrefetchPlan {
            project_key: if job.project_key.is_empty() {
                "unknown_project".to_string()
            } else {
                job.project_key.clone()
            },
            session_context_key: if job.session_context_key.is_empty() {
                "default".to_string()
            } else {
                job.session_context_key.clone()
            },
            tool_name: (*tool).to_string(),
            intent_family: job.intent_family,
            task_plane: job.task_plane,
            probability: *probability,
        })
        .collect()
}

/// Deterministic baseline text for a predicted (intent, tool) pair.
pub fn prefetch_baseline_text(intent_family: IntentFamily, tool_name: &str) -> String {
    let tool = if tool_name.trim().is_empty() { "the tool" } else { tool_name.trim() };
    match intent_family {
        IntentFamily::AuthSecurity => {
            format!("Before {tool}, validate auth assumptions and avoid exposing secrets in logs.")
        }
        IntentFamily::DeploymentOps => {
            format!("Use reversible steps for {tool} and verify rollback conditions first.")
        }
        IntentFamily::TestingValidation => {
            format!("For {tool}, prioritize reproducible checks and preserve failing-case evidence.")
        }
        IntentFamily::SchemaContracts => {
            format!("Before {tool}, verify schema and contract compatibility to avoid breaking interfaces.")
        }
        IntentFamily::OrchestrationExecution => {
            format!("Use {tool} on critical-path tasks first; unblock dependencies before parallel work.")
        }
        IntentFamily::KnowledgeAlignment => {
            format!("Use {tool} to align with existing project patterns before broad edits.")
        }
        IntentFamily::ToolReliability => {
            format!("Keep {tool} steps minimal and validate assumptions before irreversible changes.")
        }
        _ => format!("Use {tool} conservatively with fast validation and explicit rollback safety."),
    }
}

/// Worker bookkeeping persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_reason: String,
    #[serde(default)]
    pub last_run_at: Option<f64>,
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub processed_job_ids: Vec<String>,
    #[serde(default)]
    pub last_result: Value,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            paused: false,
            pause_reason: String::new(),
            last_run_at: None,
            processed_count: 0,
            processed_job_ids: Vec::new(),
            last_result: Value::Null,
        }
    }
}

/// Result of one queue-processing run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub jobs_processed: usize,
    #[serde(default)]
    pub packets_created: usize,
}

/// Consumes the prefetch queue and populates the packet store.
pub struct PrefetchWorker {
    home: SparkHome,
    pub cfg: PrefetchConfig,
}

impl PrefetchWorker {
    pub fn new(home: &SparkHome, cfg: PrefetchConfig) -> Self {
        Self { home: home.clone(), cfg }
    }

    fn state_path(&self) -> std::path::PathBuf {
        self.home.prefetch_worker_state_file()
    }

    pub fn load_state(&self) -> WorkerState {
        read_json_file(&self.state_path())
            .and_then(|doc| serde_json::from_value(doc).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, mut state: WorkerState) {
        if state.processed_job_ids.len() > PROCESSED_MAX {
            let overflow = state.processed_job_ids.len() - PROCESSED_MAX;
            state.processed_job_ids.drain(..overflow);
        }
        if let Ok(doc) = serde_json::to_value(&state) {
            let _ = atomic_write_json(&self.state_path(), &doc);
        }
    }

    /// Flip the manual pause flag.
    pub fn set_paused(&self, paused: bool, reason: &str) {
        let mut state = self.load_state();
        state.paused = paused;
        state.pause_reason = reason.chars().take(200).collect();
        self.save_state(state);
    }

    fn read_queue(&self) -> Vec<PrefetchJob> {
        read_jsonl(&self.home.prefetch_queue_file())
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect()
    }

    fn pending_jobs(&self, state: &WorkerState) -> Vec<PrefetchJob> {
        self.read_queue()
            .into_iter()
            .filter(|job| {
                !job.job_id.trim().is_empty()
                    && !state.processed_job_ids.contains(&job.job_id)
            })
            .collect()
    }

    /// Process pending jobs into predicted packets.
    pub fn process_queue(
        &self,
        store: &PacketStore,
        max_jobs: Option<usize>,
        max_tools_per_job: Option<usize>,
    ) -> RunResult {
        let mut state = self.load_state();
        if !self.cfg.worker_enabled {
            let result = RunResult {
                ok: false,
                reason: Some("worker_disabled".into()),
                ..Default::default()
            };
            state.last_result = serde_json::to_value(&result).unwrap_or(Value::Null);
            self.save_state(state);
            return result;
        }
        if state.paused {
            let result = RunResult {
                ok: false,
                reason: Some("paused".into()),
                pause_reason: Some(state.pause_reason.clone()),
                ..Default::default()
            };
            state.last_result = serde_json::to_value(&result).unwrap_or(Value::Null);
            self.save_state(state);
            return result;
        }

        let max_jobs = max_jobs.unwrap_or(self.cfg.max_jobs_per_run).max(1);
        let max_tools = max_tools_per_job.unwrap_or(self.cfg.max_tools_per_job).max(1);

        let pending = self.pending_jobs(&state);
        let jobs: Vec<PrefetchJob> = pending.into_iter().take(max_jobs).collect();
        if jobs.is_empty() {
            let result = RunResult { ok: true, ..Default::default() };
            state.last_run_at = Some(now_ts());
            state.last_result = serde_json::to_value(&result).unwrap_or(Value::Null);
            self.save_state(state);
            return result;
        }

        let mut packets_created = 0usize;
        let mut jobs_processed = 0usize;
        for job in &jobs {
            let plans = plan_prefetch_jobs(job, max_tools, self.cfg.min_probability);
            for plan in &plans {
                let text = prefetch_baseline_text(plan.intent_family, &plan.tool_name);
                let mut packet = store.build_packet(PacketDraft {
                    project_key: plan.project_key.clone(),
                    session_context_key: plan.session_context_key.clone(),
                    tool_name: plan.tool_name.clone(),
                    intent_family: plan.intent_family,
                    task_plane: plan.task_plane,
                    advisory_text: text.clone(),
                    source_mode: SourceMode::PrefetchDeterministic,
                    advice_items: vec![AdviceRow {
                        advice_id: format!(
                            "prefetch_{}_{}",
                            plan.intent_family.as_str(),
                            plan.tool_name.to_lowercase()
                        ),
                        insight_key: format!(
                            "prefetch:{}:{}",
                            plan.intent_family.as_str(),
                            plan.tool_name
                        ),
                        text,
                        confidence: plan.probability,
                        source: "prefetch".to_string(),
                        context_match: 0.7,
                        reason: "prefetch_plan".to_string(),
                    }],
                    lineage: Lineage {
                        sources: vec!["prefetch".to_string()],
                        memory_absent_declared: false,
                        trace_id: None,
                        prefetch_job_id: Some(job.job_id.clone()),
                    },
                    trace_id: None,
                    ttl_s: None,
                });
                match store.save_packet(&mut packet) {
                    Ok(_) => packets_created += 1,
                    Err(e) => debug!(job_id = %job.job_id, "prefetch packet save failed: {e}"),
                }
            }
            state.processed_job_ids.push(job.job_id.clone());
            jobs_processed += 1;
        }

        state.processed_count += jobs_processed as u64;
        state.last_run_at = Some(now_ts());
        let result = RunResult { ok: true, reason: None, pause_reason: None, jobs_processed, packets_created };
        state.last_result = serde_json::to_value(&result).unwrap_or(Value::Null);
        self.save_state(state);
        info!(jobs_processed, packets_created, "prefetch run complete");
        result
    }

    /// Worker status snapshot.
    pub fn status(&self, store: &PacketStore) -> Value {
        let state = self.load_state();
        let pending = self.pending_jobs(&state).len();
        serde_json::json!({
            "enabled": self.cfg.worker_enabled,
            "paused": state.paused,
            "pause_reason": state.pause_reason,
            "last_run_at": state.last_run_at,
            "processed_count": state.processed_count,
            "pending_jobs": pending,
            "last_result": state.last_result,
            "packets_total": store.status().total_packets,
            "config": {
                "worker_enabled": self.cfg.worker_enabled,
                "max_jobs_per_run": self.cfg.max_jobs_per_run,
                "max_tools_per_job": self.cfg.max_tools_per_job,
                "min_probability": self.cfg.min_probability,
            },
        })
    }
}
