//! Memory fusion: one evidence bundle across every available memory source.
//!
//! Collects ranked evidence from up to six optional sources. Each source is
//! isolated — a failure in one marks it missing and never poisons the
//! others. When everything comes back empty the bundle declares
//! `memory_absent` so downstream stages can fall back deterministically.

use crate::home::SparkHome;
use crate::jsonl::{read_json_file, tail_jsonl};
use crate::types::AdviceSource;
use crate::util::{keyword_overlap, now_ts};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const MAX_EVIDENCE: usize = 24;
const OUTCOMES_WINDOW_S: f64 = 14.0 * 24.0 * 3600.0;
const MIND_TIMEOUT: Duration = Duration::from_millis(1500);

/// One row of memory evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub source: AdviceSource,
    pub id: String,
    pub text: String,
    pub confidence: f64,
    pub created_at: f64,
}

/// Availability summary for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub available: bool,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The fused evidence bundle handed to the advisor and packet lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBundle {
    pub session_id: String,
    pub intent_family: String,
    pub tool_name: String,
    pub intent_text: String,
    pub generated_ts: f64,
    pub sources: BTreeMap<String, SourceSummary>,
    pub missing_sources: Vec<String>,
    pub evidence: Vec<Evidence>,
    pub evidence_count: usize,
    pub memory_absent_declared: bool,
}

impl MemoryBundle {
    /// Names of sources that contributed at least one row (packet lineage).
    pub fn contributing_sources(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, summary)| summary.count > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

// Telemetry-shaped rows leak from observers into the insight files; they
// are operational exhaust, not guidance.
static TELEMETRY_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)tool_\d+_error").unwrap(),
        Regex::new(r"(?i)^\[spark core intelligence\]").unwrap(),
        Regex::new(r"(?i)user_prompt_signal").unwrap(),
        Regex::new(r"(?i)cycle summary").unwrap(),
        Regex::new(r"(?i)\d+\s+calls to \w+").unwrap(),
        Regex::new(r"(?i)event_type:\s*(pre|post)_tool").unwrap(),
    ]
});

fn is_telemetry(text: &str) -> bool {
    TELEMETRY_RES.iter().any(|re| re.is_match(text))
}

/// Timestamp from a row field: float seconds or an ISO-8601 string.
fn row_ts(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp() as f64)
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn row_f64(row: &Value, keys: &[&str], default: f64) -> f64 {
    for key in keys {
        if let Some(v) = row.get(*key).and_then(Value::as_f64) {
            return v;
        }
    }
    default
}

fn row_str<'a>(row: &'a Value, keys: &[&str]) -> &'a str {
    for key in keys {
        if let Some(v) = row.get(*key).and_then(Value::as_str) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
    }
    ""
}

/// Keep only intent-relevant rows when the intent discriminates at all.
fn prefer_intent_relevant(rows: Vec<Evidence>, intent_text: &str) -> Vec<Evidence> {
    if intent_text.trim().is_empty() {
        return rows;
    }
    let any_relevant = rows
        .iter()
        .any(|row| keyword_overlap(intent_text, &row.text) > 0);
    if !any_relevant {
        return rows;
    }
    rows.into_iter()
        .filter(|row| keyword_overlap(intent_text, &row.text) > 0)
        .collect()
}

/// Memory fusion over a Spark home directory.
#[derive(Debug, Clone)]
pub struct MemoryFusion {
    home: SparkHome,
    /// Chips can be disabled when an observer floods its insight files.
    pub disable_chips: bool,
    /// Optional HTTP bridge to an external memory system.
    pub mind_bridge_url: Option<String>,
}

impl MemoryFusion {
    pub fn new(home: &SparkHome) -> Self {
        let disable_chips = std::env::var("SPARK_ADVISORY_DISABLE_CHIPS")
            .map(|v| v == "1")
            .unwrap_or(false);
        let mind_bridge_url = std::env::var("SPARK_MIND_BRIDGE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self { home: home.clone(), disable_chips, mind_bridge_url }
    }

    /// Build a single memory evidence bundle for advisory decisions.
    pub async fn build_memory_bundle(
        &self,
        session_id: &str,
        intent_text: &str,
        intent_family: &str,
        tool_name: &str,
        include_mind: bool,
    ) -> MemoryBundle {
        let mut results: Vec<(&str, Result<Vec<Evidence>, String>)> = vec![
            ("cognitive", self.collect_cognitive(6)),
            ("eidos", self.collect_eidos(intent_text, 5)),
            ("chips", self.collect_chips(6, intent_text)),
            ("outcomes", self.collect_outcomes(intent_text, 6)),
            ("orchestration", self.collect_orchestration(5)),
        ];
        if include_mind {
            results.push(("mind", self.collect_mind(intent_text, 4).await));
        }

        let mut evidence: Vec<Evidence> = Vec::new();
        let mut missing_sources: Vec<String> = Vec::new();
        let mut sources: BTreeMap<String, SourceSummary> = BTreeMap::new();

        for (name, result) in results {
            match result {
                Ok(rows) => {
                    sources.insert(
                        name.to_string(),
                        SourceSummary { available: true, count: rows.len(), error: None },
                    );
                    evidence.extend(rows);
                }
                Err(error) => {
                    missing_sources.push(name.to_string());
                    sources.insert(
                        name.to_string(),
                        SourceSummary { available: false, count: 0, error: Some(error) },
                    );
                }
            }
        }

        evidence.retain(|row| !row.text.trim().is_empty());
        evidence = prefer_intent_relevant(evidence, intent_text);
        evidence.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(b.created_at.total_cmp(&a.created_at))
        });
        evidence.truncate(MAX_EVIDENCE);

        let memory_absent = evidence.is_empty();
        if memory_absent {
            debug!(session_id, "memory_absent declared: no evidence from any source");
        }

        MemoryBundle {
            session_id: session_id.to_string(),
            intent_family: intent_family.to_string(),
            tool_name: tool_name.to_string(),
            intent_text: intent_text.to_string(),
            generated_ts: now_ts(),
            sources,
            missing_sources,
            evidence_count: evidence.len(),
            memory_absent_declared: memory_absent,
            evidence,
        }
    }

    /// Cognitive insights: one JSON document, list or `{insights: …}` map.
    fn collect_cognitive(&self, limit: usize) -> Result<Vec<Evidence>, String> {
        let path = self.home.cognitive_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = read_json_file(&path).ok_or_else(|| "unparseable cognitive file".to_string())?;

        let rows: Vec<&Value> = match &data {
            Value::Array(items) => items.iter().filter(|v| v.is_object()).collect(),
            Value::Object(_) => match data.get("insights") {
                Some(Value::Object(map)) => map.values().filter(|v| v.is_object()).collect(),
                Some(Value::Array(items)) => items.iter().filter(|v| v.is_object()).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        let start = rows.len().saturating_sub(limit);
        let mut out = Vec::new();
        for row in &rows[start..] {
            let text = row_str(row, &["insight", "text"]);
            if text.is_empty() || is_telemetry(text) {
                continue;
            }
            out.push(Evidence {
                source: AdviceSource::Cognitive,
                id: {
                    let id = row_str(row, &["key", "insight_key"]);
                    if id.is_empty() {
                        text.chars().take(48).collect()
                    } else {
                        id.to_string()
                    }
                },
                text: text.to_string(),
                confidence: row_f64(row, &["reliability", "confidence"], 0.5),
                created_at: row_ts(row.get("timestamp").or_else(|| row.get("created_at"))),
            });
        }
        Ok(out)
    }

    /// Distilled truths: JSONL, retrieved only against a concrete intent.
    fn collect_eidos(&self, intent_text: &str, limit: usize) -> Result<Vec<Evidence>, String> {
        if intent_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = tail_jsonl(&self.home.eidos_file(), limit * 8);
        let evidence: Vec<Evidence> = rows
            .iter()
            .filter_map(|row| {
                let statement = row_str(row, &["statement", "text"]);
                if statement.is_empty() {
                    return None;
                }
                Some(Evidence {
                    source: AdviceSource::Eidos,
                    id: {
                        let id = row_str(row, &["distillation_id", "id"]);
                        if id.is_empty() {
                            statement.chars().take(48).collect()
                        } else {
                            id.to_string()
                        }
                    },
                    text: statement.to_string(),
                    confidence: row_f64(row, &["confidence"], 0.6),
                    created_at: row_ts(row.get("created_at")),
                })
            })
            .collect();
        Ok(prefer_intent_relevant(evidence, intent_text)
            .into_iter()
            .take(limit)
            .collect())
    }

    /// Observer chips: newest three JSONL files, a few rows each.
    ///
    /// Understands both the legacy `{insight|text|summary}` rows and the
    /// modern `{content, captured_data.quality_score.total}` schema.
    fn collect_chips(&self, limit: usize, intent_text: &str) -> Result<Vec<Evidence>, String> {
        if self.disable_chips {
            return Ok(Vec::new());
        }
        let dir = self.home.chip_insights_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(std::path::PathBuf, std::time::SystemTime)> = std::fs::read_dir(&dir)
            .map_err(|e| e.to_string())?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    return None;
                }
                let mtime = path.metadata().ok()?.modified().ok()?;
                Some((path, mtime))
            })
            .collect();
        files.sort_by(|a, b| b.1.cmp(&a.1));

        let mut evidence = Vec::new();
        for (path, _) in files.iter().take(3) {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("chip")
                .to_string();
            for row in tail_jsonl(path, 3) {
                let text = row_str(&row, &["insight", "text", "summary", "content"]);
                if text.is_empty() || is_telemetry(text) {
                    continue;
                }
                let quality = row
                    .get("captured_data")
                    .and_then(|v| v.get("quality_score"))
                    .and_then(|v| v.get("total"))
                    .and_then(Value::as_f64);
                evidence.push(Evidence {
                    source: AdviceSource::Chips,
                    id: {
                        let id = row_str(&row, &["insight_key", "id", "chip_id"]);
                        if id.is_empty() {
                            format!("{stem}:{}", evidence.len())
                        } else {
                            id.to_string()
                        }
                    },
                    text: text.to_string(),
                    confidence: quality.unwrap_or_else(|| row_f64(&row, &["score", "confidence"], 0.55)),
                    created_at: row_ts(row.get("ts").or_else(|| {
                        row.get("timestamp").or_else(|| row.get("created_at"))
                    })),
                });
                if evidence.len() >= limit {
                    return Ok(prefer_intent_relevant(evidence, intent_text));
                }
            }
        }
        Ok(prefer_intent_relevant(evidence, intent_text))
    }

    /// Outcome log: bounded recent window, polarity-weighted confidence.
    fn collect_outcomes(&self, intent_text: &str, limit: usize) -> Result<Vec<Evidence>, String> {
        let cutoff = now_ts() - OUTCOMES_WINDOW_S;
        let rows = tail_jsonl(&self.home.outcomes_log(), limit * 4);
        let evidence: Vec<Evidence> = rows
            .iter()
            .filter(|row| row_ts(row.get("created_at")) >= cutoff)
            .filter_map(|row| {
                let text = row_str(row, &["text", "result"]);
                if text.is_empty() {
                    return None;
                }
                let polarity = row_str(row, &["polarity"]);
                let confidence = match polarity {
                    "pos" => 0.7,
                    "" | "neutral" => 0.45,
                    _ => 0.8,
                };
                Some(Evidence {
                    source: AdviceSource::Outcomes,
                    id: {
                        let id = row_str(row, &["outcome_id"]);
                        if id.is_empty() {
                            format!("outcome:{}", text.chars().take(32).collect::<String>())
                        } else {
                            id.to_string()
                        }
                    },
                    text: text.to_string(),
                    confidence,
                    created_at: row_ts(row.get("created_at")),
                })
            })
            .collect();
        Ok(prefer_intent_relevant(evidence, intent_text)
            .into_iter()
            .take(limit)
            .collect())
    }

    /// Orchestration handoffs: tail of the handoff ledger.
    fn collect_orchestration(&self, limit: usize) -> Result<Vec<Evidence>, String> {
        let path = self.home.handoffs_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for row in tail_jsonl(&path, limit) {
            let empty = Value::Null;
            let ctx = row.get("context").unwrap_or(&empty);
            let prompt = row_str(ctx, &["prompt", "task", "summary"]);
            if prompt.is_empty() {
                continue;
            }
            out.push(Evidence {
                source: AdviceSource::Orchestration,
                id: {
                    let id = row_str(&row, &["handoff_id"]);
                    if id.is_empty() {
                        format!("handoff:{}", out.len())
                    } else {
                        id.to_string()
                    }
                },
                text: prompt.to_string(),
                confidence: 0.55,
                created_at: row_ts(row.get("timestamp")),
            });
        }
        Ok(out)
    }

    /// External knowledge bridge, reached over localhost HTTP.
    async fn collect_mind(&self, intent_text: &str, limit: usize) -> Result<Vec<Evidence>, String> {
        if intent_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Some(base) = &self.mind_bridge_url else {
            return Err("mind bridge not configured".to_string());
        };
        let client = reqwest::Client::builder()
            .timeout(MIND_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let url = format!("{}/retrieve", base.trim_end_matches('/'));
        let response = client
            .get(&url)
            .query(&[("q", intent_text), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let rows: Vec<Value> = response.json().await.map_err(|e| e.to_string())?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let text = row_str(row, &["content", "text"]);
                if text.is_empty() {
                    return None;
                }
                Some(Evidence {
                    source: AdviceSource::Mind,
                    id: {
                        let id = row_str(row, &["memory_id", "id"]);
                        if id.is_empty() {
                            format!("mind:{}", text.chars().take(32).collect::<String>())
                        } else {
                            id.to_string()
                        }
                    },
                    text: text.to_string(),
                    confidence: row_f64(row, &["score", "confidence"], 0.6),
                    created_at: row_ts(row.get("created_at")),
                })
            })
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fusion_at(dir: &TempDir) -> MemoryFusion {
        let home = SparkHome::at(dir.path());
        home.ensure_dirs().unwrap();
        MemoryFusion { home, disable_chips: false, mind_bridge_url: None }
    }

    fn write_jsonl(path: &std::path::Path, rows: &[Value]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = rows.iter().map(|r| format!("{r}\n")).collect();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_bundle_includes_available_sources() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        std::fs::write(
            fusion.home.cognitive_file(),
            json!([
                {"insight": "Validate contract before merge", "reliability": 0.8, "timestamp": 1.0}
            ])
            .to_string(),
        )
        .unwrap();
        write_jsonl(
            &fusion.home.eidos_file(),
            &[json!({"statement": "Validate contract compatibility early", "distillation_id": "d1", "confidence": 0.7, "created_at": 2.0})],
        );

        let bundle = fusion
            .build_memory_bundle("s1", "validate contract work", "schema_contracts", "Edit", false)
            .await;

        assert_eq!(bundle.evidence_count, 2);
        assert!(!bundle.memory_absent_declared);
        assert_eq!(bundle.sources["cognitive"].count, 1);
        assert_eq!(bundle.sources["eidos"].count, 1);
        assert!(bundle.contributing_sources().contains(&"eidos".to_string()));
    }

    #[tokio::test]
    async fn test_bundle_declares_absent_when_no_evidence() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        let bundle = fusion
            .build_memory_bundle("s1", "", "emergent_other", "Read", false)
            .await;
        assert_eq!(bundle.evidence_count, 0);
        assert!(bundle.memory_absent_declared);
    }

    #[tokio::test]
    async fn test_mind_marked_missing_when_unconfigured() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        let bundle = fusion
            .build_memory_bundle("s1", "anything", "emergent_other", "Read", true)
            .await;
        assert!(bundle.missing_sources.contains(&"mind".to_string()));
        assert!(!bundle.sources["mind"].available);
        assert!(bundle.sources["mind"].error.is_some());
    }

    #[tokio::test]
    async fn test_filters_tool_error_noise() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        std::fs::write(
            fusion.home.cognitive_file(),
            json!([
                {"insight": "I struggle with tool_49_error tasks", "reliability": 0.9, "timestamp": 2.0},
                {"insight": "Validate contract before merge", "reliability": 0.8, "timestamp": 1.0}
            ])
            .to_string(),
        )
        .unwrap();

        let bundle = fusion
            .build_memory_bundle("s1", "", "emergent_other", "Read", false)
            .await;
        let texts: Vec<&str> = bundle.evidence.iter().map(|e| e.text.as_str()).collect();
        assert!(texts.contains(&"Validate contract before merge"));
        assert!(texts.iter().all(|t| !t.contains("tool_49_error")));
    }

    #[tokio::test]
    async fn test_prefers_intent_relevant_evidence() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        std::fs::write(
            fusion.home.cognitive_file(),
            json!([
                {"insight": "Multiplier granted formatting pattern", "reliability": 0.9, "timestamp": 5.0},
                {"insight": "Auth token session mismatch should be validated first", "reliability": 0.7, "timestamp": 4.0}
            ])
            .to_string(),
        )
        .unwrap();

        let bundle = fusion
            .build_memory_bundle("s1", "auth token timeout and session binding", "auth_security", "Read", false)
            .await;
        let joined = bundle
            .evidence
            .iter()
            .map(|e| e.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" | ");
        assert!(joined.contains("auth token session mismatch"));
        assert!(!joined.contains("multiplier granted formatting pattern"));
    }

    #[test]
    fn test_collect_outcomes_prefers_intent_relevant_rows() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        let now = now_ts();
        write_jsonl(
            &fusion.home.outcomes_log(),
            &[
                json!({"outcome_id": "o1", "text": "Fix auth token session mismatch with explicit session binding", "created_at": now - 30.0, "polarity": "pos"}),
                json!({"outcome_id": "o2", "text": "Random social formatting advice", "created_at": now - 20.0, "polarity": "pos"}),
                json!({"outcome_id": "o3", "text": "Check auth timeout and token refresh path", "created_at": now - 10.0, "polarity": "neutral"}),
            ],
        );

        let out = fusion
            .collect_outcomes("auth token timeout session", 2)
            .unwrap();
        let joined = out
            .iter()
            .map(|e| e.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" | ");
        assert!(joined.contains("auth token"));
    }

    #[test]
    fn test_collect_outcomes_drops_old_rows() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        let now = now_ts();
        write_jsonl(
            &fusion.home.outcomes_log(),
            &[json!({"outcome_id": "old", "text": "Ancient outcome", "created_at": now - OUTCOMES_WINDOW_S - 100.0, "polarity": "pos"})],
        );
        assert!(fusion.collect_outcomes("", 6).unwrap().is_empty());
    }

    #[test]
    fn test_collect_chips_parses_modern_content_schema() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        write_jsonl(
            &fusion.home.chip_insights_dir().join("marketing.jsonl"),
            &[json!({
                "chip_id": "marketing",
                "observer_name": "campaign_observer",
                "content": "Improve conversion quality before increasing ad spend.",
                "timestamp": "2026-02-12T23:00:00+00:00",
                "captured_data": {"quality_score": {"total": 0.55}}
            })],
        );

        let out = fusion.collect_chips(3, "").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, AdviceSource::Chips);
        assert!(out[0].text.to_lowercase().contains("conversion quality"));
        assert!((out[0].confidence - 0.55).abs() < 1e-9);
        assert!(out[0].created_at > 0.0);
    }

    #[test]
    fn test_collect_chips_filters_telemetry() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        write_jsonl(
            &fusion.home.chip_insights_dir().join("spark-core.jsonl"),
            &[json!({
                "chip_id": "spark-core",
                "content": "[Spark Core Intelligence] user_prompt_signal: event_type: post_tool",
                "captured_data": {"quality_score": {"total": 0.9}}
            })],
        );
        write_jsonl(
            &fusion.home.chip_insights_dir().join("marketing.jsonl"),
            &[json!({
                "chip_id": "marketing",
                "content": "Increase conversion quality before scaling ad spend.",
                "captured_data": {"quality_score": {"total": 0.6}}
            })],
        );

        let out = fusion.collect_chips(3, "marketing campaign conversion").unwrap();
        let joined = out
            .iter()
            .map(|e| e.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" | ");
        assert!(!joined.contains("spark core intelligence"));
        assert!(joined.contains("conversion quality"));
    }

    #[test]
    fn test_collect_chips_disabled() {
        let dir = TempDir::new().unwrap();
        let mut fusion = fusion_at(&dir);
        fusion.disable_chips = true;
        write_jsonl(
            &fusion.home.chip_insights_dir().join("marketing.jsonl"),
            &[json!({"content": "Anything at all"})],
        );
        assert!(fusion.collect_chips(3, "").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evidence_sorted_by_confidence_then_recency() {
        let dir = TempDir::new().unwrap();
        let fusion = fusion_at(&dir);
        std::fs::write(
            fusion.home.cognitive_file(),
            json!([
                {"insight": "Low confidence hint", "reliability": 0.3, "timestamp": 9.0},
                {"insight": "High confidence rule", "reliability": 0.9, "timestamp": 1.0}
            ])
            .to_string(),
        )
        .unwrap();
        let bundle = fusion
            .build_memory_bundle("s1", "", "emergent_other", "Read", false)
            .await;
        assert_eq!(bundle.evidence[0].text, "High confidence rule");
    }
}
