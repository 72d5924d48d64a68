//! Content-addressed packet store for predictive/direct-path reuse.
//!
//! Packets are cached, composed advisories keyed by
//! `(project, session_context, tool, intent_family)`. The store offers
//! deterministic CRUD, exact and relaxed lookup, invalidation helpers,
//! usage/feedback counters, and the prefetch queue append. One JSON file
//! per packet plus a single index document; all writes are temp-file +
//! rename, and the index is cached in memory keyed by file mtime because
//! lookups sit on the pre-tool hot path.

use crate::config::PacketStoreConfig;
use crate::error::{Result, SparkError};
use crate::home::SparkHome;
use crate::jsonl::{append_jsonl_capped, atomic_write_json, read_json_file};
use crate::types::{
    AdviceRow, IntentFamily, Lineage, Packet, PacketFeedback, PacketMeta, PrefetchJob,
    SourceMode, TaskPlane,
};
use crate::util::{now_ts, sanitize_token, sha1_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

const PREFETCH_QUEUE_MAX_LINES: usize = 4000;

/// Fields a raw packet document must carry to be accepted.
const REQUIRED_PACKET_FIELDS: &[&str] = &[
    "packet_id",
    "project_key",
    "session_context_key",
    "tool_name",
    "intent_family",
    "task_plane",
    "advisory_text",
    "source_mode",
    "created_ts",
    "updated_ts",
    "fresh_until_ts",
    "lineage",
    "usage_count",
    "emit_count",
    "helpful_count",
    "unhelpful_count",
    "noisy_count",
    "feedback_count",
    "effectiveness_score",
];
const REQUIRED_LINEAGE_FIELDS: &[&str] = &["sources", "memory_absent_declared"];

/// On-disk index: exact key → packet id, plus per-packet metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketIndex {
    #[serde(default)]
    pub by_exact: HashMap<String, String>,
    #[serde(default)]
    pub packet_meta: HashMap<String, PacketMeta>,
}

#[derive(Debug)]
struct CachedIndex {
    mtime: Option<SystemTime>,
    index: PacketIndex,
}

/// Inputs for constructing a packet.
#[derive(Debug, Clone)]
pub struct PacketDraft {
    pub project_key: String,
    pub session_context_key: String,
    pub tool_name: String,
    pub intent_family: IntentFamily,
    pub task_plane: TaskPlane,
    pub advisory_text: String,
    pub source_mode: SourceMode,
    pub advice_items: Vec<AdviceRow>,
    pub lineage: Lineage,
    pub trace_id: Option<String>,
    pub ttl_s: Option<f64>,
}

/// Filter for bulk invalidation.
#[derive(Debug, Clone, Default)]
pub struct InvalidateFilter {
    pub project_key: Option<String>,
    pub tool_name: Option<String>,
    pub intent_family: Option<IntentFamily>,
    /// Edited file path; restricts invalidation to packets referencing it.
    pub file_hint: Option<String>,
}

/// Aggregate store counters for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub total_packets: usize,
    pub active_packets: usize,
    pub fresh_packets: usize,
    pub queue_depth: usize,
    pub usage_total: u64,
    pub emit_total: u64,
    pub feedback_total: u64,
    pub hit_rate: Option<f64>,
    pub avg_effectiveness_score: f64,
}

/// Persistent, content-addressed cache of composed advisories.
pub struct PacketStore {
    dir: PathBuf,
    index_file: PathBuf,
    queue_file: PathBuf,
    pub cfg: PacketStoreConfig,
    cache: Mutex<Option<CachedIndex>>,
}

impl PacketStore {
    pub fn new(home: &SparkHome, cfg: PacketStoreConfig) -> Self {
        Self {
            dir: home.packet_dir(),
            index_file: home.index_file(),
            queue_file: home.prefetch_queue_file(),
            cfg,
            cache: Mutex::new(None),
        }
    }

    fn packet_path(&self, packet_id: &str) -> PathBuf {
        self.dir.join(format!("{packet_id}.json"))
    }

    /// Deterministic lookup key over the four routing dimensions.
    pub fn exact_key(
        project_key: &str,
        session_context_key: &str,
        tool_name: &str,
        intent_family: IntentFamily,
    ) -> String {
        format!(
            "{project_key}|{session_context_key}|{tool_name}|{}",
            intent_family.as_str()
        )
    }

    fn make_packet_id(exact_key: &str, created_ts: f64) -> String {
        let digest = sha1_hex(&format!("{exact_key}|{created_ts:.6}"));
        format!("pkt_{}", &digest[..12])
    }

    /// Construct an in-memory packet with normalized counters.
    pub fn build_packet(&self, draft: PacketDraft) -> Packet {
        let created = now_ts();
        let project = sanitize_token(&draft.project_key, "unknown_project");
        let session_ctx = sanitize_token(&draft.session_context_key, "default");
        let tool = sanitize_token(&draft.tool_name, "*");
        let key = Self::exact_key(&project, &session_ctx, &tool, draft.intent_family);
        let ttl = draft.ttl_s.unwrap_or(self.cfg.packet_ttl_s).max(30.0);

        let mut lineage = draft.lineage;
        if lineage.trace_id.is_none() {
            lineage.trace_id = draft.trace_id;
        }

        let mut packet = Packet {
            packet_id: Self::make_packet_id(&key, created),
            project_key: project,
            session_context_key: session_ctx,
            tool_name: tool,
            intent_family: draft.intent_family,
            task_plane: draft.task_plane,
            advisory_text: draft.advisory_text.trim().to_string(),
            source_mode: draft.source_mode,
            advice_items: draft.advice_items,
            lineage,
            created_ts: created,
            updated_ts: created,
            fresh_until_ts: created + ttl,
            invalidated: false,
            invalidate_reason: String::new(),
            usage_count: 0,
            emit_count: 0,
            helpful_count: 0,
            unhelpful_count: 0,
            noisy_count: 0,
            feedback_count: 0,
            effectiveness_score: 0.5,
            last_used_ts: None,
            last_route: String::new(),
            last_feedback: None,
        };
        packet.normalize();
        packet
    }

    /// Struct-level validation enforced at save time.
    pub fn validate_packet(packet: &Packet) -> Result<()> {
        if packet.packet_id.trim().is_empty() {
            return Err(SparkError::InvalidPacket("packet_id missing".into()));
        }
        if packet.project_key.trim().is_empty() {
            return Err(SparkError::InvalidPacket("project_key missing".into()));
        }
        if packet.tool_name.trim().is_empty() {
            return Err(SparkError::InvalidPacket("tool_name missing".into()));
        }
        if packet.fresh_until_ts < packet.created_ts {
            return Err(SparkError::InvalidPacket("fresh_until_ts before created_ts".into()));
        }
        Ok(())
    }

    /// Schema validation for raw documents arriving from outside the
    /// typed API (dashboards, imports).
    pub fn validate_packet_document(doc: &Value) -> Result<()> {
        let Some(obj) = doc.as_object() else {
            return Err(SparkError::InvalidPacket("packet must be an object".into()));
        };
        let missing: Vec<&str> = REQUIRED_PACKET_FIELDS
            .iter()
            .copied()
            .filter(|field| !obj.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(SparkError::InvalidPacket(format!(
                "missing_fields:{}",
                missing.join(",")
            )));
        }
        let Some(lineage) = obj.get("lineage").and_then(Value::as_object) else {
            return Err(SparkError::InvalidPacket("lineage must be an object".into()));
        };
        let missing: Vec<&str> = REQUIRED_LINEAGE_FIELDS
            .iter()
            .copied()
            .filter(|field| !lineage.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(SparkError::InvalidPacket(format!(
                "missing_lineage_fields:{}",
                missing.join(",")
            )));
        }
        if !obj["advisory_text"].is_string() {
            return Err(SparkError::InvalidPacket("advisory_text must be string".into()));
        }
        Ok(())
    }

    /// Normalize, validate, persist, and index a packet. Returns its id.
    pub fn save_packet(&self, packet: &mut Packet) -> Result<String> {
        packet.normalize();
        Self::validate_packet(packet)?;
        packet.updated_ts = now_ts();

        std::fs::create_dir_all(&self.dir)?;
        atomic_write_json(&self.packet_path(&packet.packet_id), &serde_json::to_value(&*packet)?)?;

        let mut index = self.load_index();
        let key = Self::exact_key(
            &packet.project_key,
            &packet.session_context_key,
            &packet.tool_name,
            packet.intent_family,
        );
        index.by_exact.insert(key, packet.packet_id.clone());
        index
            .packet_meta
            .insert(packet.packet_id.clone(), PacketMeta::from_packet(packet));
        self.prune_index(&mut index);
        self.save_index(index)?;
        Ok(packet.packet_id.clone())
    }

    /// Drop the oldest-updated metadata rows beyond the index bound, along
    /// with exact keys that pointed at them.
    fn prune_index(&self, index: &mut PacketIndex) {
        if index.packet_meta.len() <= self.cfg.max_index_packets {
            return;
        }
        let mut ordered: Vec<(String, f64)> = index
            .packet_meta
            .iter()
            .map(|(id, meta)| (id.clone(), meta.updated_ts))
            .collect();
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1));
        let remove_count = index.packet_meta.len() - self.cfg.max_index_packets;
        let remove_ids: Vec<String> = ordered
            .into_iter()
            .take(remove_count)
            .map(|(id, _)| id)
            .collect();
        for id in &remove_ids {
            index.packet_meta.remove(id);
            let _ = std::fs::remove_file(self.packet_path(id));
        }
        index
            .by_exact
            .retain(|_, packet_id| !remove_ids.contains(packet_id));
        debug!(removed = remove_ids.len(), "pruned packet index");
    }

    fn load_index(&self) -> PacketIndex {
        let mtime = std::fs::metadata(&self.index_file)
            .and_then(|m| m.modified())
            .ok();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.as_ref() {
            if cached.mtime.is_some() && cached.mtime == mtime {
                return cached.index.clone();
            }
        }
        let index = read_json_file(&self.index_file)
            .and_then(|doc| serde_json::from_value::<PacketIndex>(doc).ok())
            .unwrap_or_default();
        *cache = Some(CachedIndex { mtime, index: index.clone() });
        index
    }

    fn save_index(&self, index: PacketIndex) -> Result<()> {
        atomic_write_json(&self.index_file, &serde_json::to_value(&index)?)?;
        let mtime = std::fs::metadata(&self.index_file)
            .and_then(|m| m.modified())
            .ok();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedIndex { mtime, index });
        Ok(())
    }

    /// Read and normalize a packet; missing or corrupt yields `None`.
    pub fn get_packet(&self, packet_id: &str) -> Option<Packet> {
        if packet_id.is_empty() {
            return None;
        }
        let doc = read_json_file(&self.packet_path(packet_id))?;
        let mut packet: Packet = serde_json::from_value(doc).ok()?;
        packet.normalize();
        Some(packet)
    }

    /// Deterministic lookup; only fresh packets are returned.
    pub fn lookup_exact(
        &self,
        project_key: &str,
        session_context_key: &str,
        tool_name: &str,
        intent_family: IntentFamily,
    ) -> Option<Packet> {
        let index = self.load_index();
        let key = Self::exact_key(project_key, session_context_key, tool_name, intent_family);
        let packet_id = index.by_exact.get(&key)?;
        let packet = self.get_packet(packet_id)?;
        packet.is_fresh(now_ts()).then_some(packet)
    }

    /// Weighted best-match over fresh packets of the same project.
    ///
    /// Weights and thresholds come from config: +4 tool, +3 intent,
    /// +2 plane, +0.5 wildcard-tool bonus when no tool is given, plus an
    /// effectiveness term and a tiny recency micro-bonus.
    pub fn lookup_relaxed(
        &self,
        project_key: &str,
        tool_name: Option<&str>,
        intent_family: Option<IntentFamily>,
        task_plane: Option<TaskPlane>,
    ) -> Option<Packet> {
        let index = self.load_index();
        let now = now_ts();
        let mut candidates: Vec<(f64, f64, String)> = Vec::new();

        for (packet_id, meta) in &index.packet_meta {
            if meta.project_key != project_key || !meta.is_fresh(now) {
                continue;
            }
            let mut score = 0.0;
            let mut match_score = 0.0;
            let mut match_dimensions = 0usize;
            if let Some(tool) = tool_name {
                if !tool.is_empty() && meta.tool_name == tool {
                    score += 4.0;
                    match_score += 4.0;
                    match_dimensions += 1;
                }
            }
            if let Some(intent) = intent_family {
                if meta.intent_family == intent {
                    score += 3.0;
                    match_score += 3.0;
                    match_dimensions += 1;
                }
            }
            if let Some(plane) = task_plane {
                if meta.task_plane == plane {
                    score += 2.0;
                    match_score += 2.0;
                    match_dimensions += 1;
                }
            }
            if tool_name.map(|t| t.is_empty()).unwrap_or(true) && meta.tool_name == "*" {
                score += 0.5;
                match_score += 0.5;
                match_dimensions += 1;
            }
            if match_dimensions < self.cfg.relaxed_min_match_dimensions
                || match_score < self.cfg.relaxed_min_match_score
            {
                continue;
            }
            let effectiveness = meta.effectiveness_score.clamp(0.0, 1.0);
            score += effectiveness * self.cfg.relaxed_effectiveness_weight;
            if effectiveness < self.cfg.relaxed_low_effectiveness_threshold {
                score -= self.cfg.relaxed_low_effectiveness_penalty;
            }
            score += (meta.updated_ts / 1e10).clamp(0.0, 1.0);
            candidates.push((score, meta.updated_ts, packet_id.clone()));
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.total_cmp(&a.1)));
        for (_, _, packet_id) in candidates.into_iter().take(self.cfg.packet_lookup_candidates) {
            if let Some(packet) = self.get_packet(&packet_id) {
                if packet.is_fresh(now) {
                    return Some(packet);
                }
            }
        }
        None
    }

    /// Flag one packet invalid and persist both the packet and the index.
    pub fn invalidate_packet(&self, packet_id: &str, reason: &str) -> bool {
        let Some(mut packet) = self.get_packet(packet_id) else { return false };
        packet.invalidated = true;
        packet.invalidate_reason = reason.chars().take(200).collect();
        packet.updated_ts = now_ts();
        let doc = match serde_json::to_value(&packet) {
            Ok(doc) => doc,
            Err(_) => return false,
        };
        if let Err(e) = atomic_write_json(&self.packet_path(packet_id), &doc) {
            warn!(packet_id, "invalidate write failed: {e}");
            return false;
        }
        let mut index = self.load_index();
        if let Some(meta) = index.packet_meta.get_mut(packet_id) {
            meta.invalidated = true;
            meta.updated_ts = packet.updated_ts;
        }
        let _ = self.save_index(index);
        true
    }

    /// Filtered bulk invalidation.
    ///
    /// With a `file_hint`, only packets whose advisory text or advice items
    /// reference the file's basename are invalidated; wildcard-tool
    /// baseline packets are never invalidated by a file hint alone.
    pub fn invalidate_packets(&self, filter: &InvalidateFilter, reason: &str) -> usize {
        let index = self.load_index();
        let file_hint = filter.file_hint.as_deref().map(|hint| {
            hint.replace('\\', "/")
                .rsplit('/')
                .next()
                .unwrap_or(hint)
                .to_lowercase()
        });

        let mut to_invalidate = Vec::new();
        for (packet_id, meta) in &index.packet_meta {
            if let Some(project) = &filter.project_key {
                if &meta.project_key != project {
                    continue;
                }
            }
            if let Some(tool) = &filter.tool_name {
                if &meta.tool_name != tool {
                    continue;
                }
            }
            if let Some(intent) = filter.intent_family {
                if meta.intent_family != intent {
                    continue;
                }
            }
            if let Some(hint) = &file_hint {
                if meta.tool_name == "*" {
                    continue;
                }
                let Some(packet) = self.get_packet(packet_id) else { continue };
                let text = packet.advisory_text.to_lowercase();
                let items = serde_json::to_string(&packet.advice_items)
                    .unwrap_or_default()
                    .to_lowercase();
                if !text.contains(hint.as_str()) && !items.contains(hint.as_str()) {
                    continue;
                }
            }
            to_invalidate.push(packet_id.clone());
        }

        to_invalidate
            .iter()
            .filter(|id| self.invalidate_packet(id, reason))
            .count()
    }

    /// Stamp a use of the packet (lookup hit, emitted or not).
    pub fn record_packet_usage(&self, packet_id: &str, emitted: bool, route: &str) -> Result<()> {
        let mut packet = self
            .get_packet(packet_id)
            .ok_or_else(|| SparkError::PacketNotFound(packet_id.to_string()))?;
        packet.usage_count += 1;
        if emitted {
            packet.emit_count += 1;
        }
        if !route.is_empty() {
            packet.last_route = route.to_string();
        }
        packet.last_used_ts = Some(now_ts());
        self.save_packet(&mut packet)?;
        Ok(())
    }

    /// Apply helpful/unhelpful/noisy feedback and recompute effectiveness.
    pub fn record_packet_feedback(
        &self,
        packet_id: &str,
        helpful: Option<bool>,
        noisy: bool,
        followed: bool,
        source: &str,
    ) -> Result<f64> {
        let mut packet = self
            .get_packet(packet_id)
            .ok_or_else(|| SparkError::PacketNotFound(packet_id.to_string()))?;
        packet.feedback_count += 1;
        match helpful {
            Some(true) => packet.helpful_count += 1,
            Some(false) => packet.unhelpful_count += 1,
            None => {}
        }
        if noisy {
            packet.noisy_count += 1;
        }
        packet.last_feedback = Some(PacketFeedback {
            helpful,
            noisy,
            followed,
            source: source.chars().take(80).collect(),
            ts: now_ts(),
        });
        self.save_packet(&mut packet)?;
        Ok(packet.effectiveness_score)
    }

    /// Walk the index newest-first and apply feedback to the packet whose
    /// advice items contain the given advice id.
    pub fn record_packet_feedback_for_advice(
        &self,
        advice_id: &str,
        helpful: Option<bool>,
        noisy: bool,
        followed: bool,
        source: &str,
    ) -> Option<String> {
        let advice = advice_id.trim();
        if advice.is_empty() {
            return None;
        }
        let index = self.load_index();
        let mut ordered: Vec<(&String, f64)> = index
            .packet_meta
            .iter()
            .map(|(id, meta)| (id, meta.updated_ts))
            .collect();
        ordered.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (packet_id, _) in ordered {
            let Some(packet) = self.get_packet(packet_id) else { continue };
            if packet
                .advice_items
                .iter()
                .any(|row| row.advice_id.trim() == advice)
            {
                return self
                    .record_packet_feedback(packet_id, helpful, noisy, followed, source)
                    .ok()
                    .map(|_| packet_id.clone());
            }
        }
        None
    }

    /// Append a prefetch job to the queue, generating an id if absent.
    pub fn enqueue_prefetch_job(&self, mut job: PrefetchJob) -> Result<String> {
        std::fs::create_dir_all(&self.dir)?;
        if job.job_id.is_empty() {
            let payload = serde_json::to_string(&job)?;
            let digest = sha1_hex(&format!("{:.6}|{payload}", job.created_ts));
            job.job_id = format!("pf_{}", &digest[..10]);
        }
        append_jsonl_capped(
            &self.queue_file,
            &serde_json::to_value(&job)?,
            PREFETCH_QUEUE_MAX_LINES,
        )?;
        Ok(job.job_id)
    }

    pub fn queue_file(&self) -> &std::path::Path {
        &self.queue_file
    }

    /// Aggregate counters for the status surface.
    pub fn status(&self) -> StoreStatus {
        let index = self.load_index();
        let now = now_ts();
        let meta = &index.packet_meta;
        let total = meta.len();
        let active = meta.values().filter(|m| !m.invalidated).count();
        let fresh = meta.values().filter(|m| m.is_fresh(now)).count();
        let queue_depth = std::fs::read_to_string(&self.queue_file)
            .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);
        let usage_total: u64 = meta.values().map(|m| m.usage_count).sum();
        let emit_total: u64 = meta.values().map(|m| m.emit_count).sum();
        let feedback_total: u64 = meta.values().map(|m| m.feedback_count).sum();
        let avg_effectiveness = if meta.is_empty() {
            0.0
        } else {
            meta.values().map(|m| m.effectiveness_score).sum::<f64>() / total as f64
        };
        StoreStatus {
            total_packets: total,
            active_packets: active,
            fresh_packets: fresh,
            queue_depth,
            usage_total,
            emit_total,
            feedback_total,
            hit_rate: (usage_total > 0).then(|| emit_total as f64 / usage_total as f64),
            avg_effectiveness_score: (avg_effectiveness * 1000.0).round() / 1000.0,
        }
    }
}
