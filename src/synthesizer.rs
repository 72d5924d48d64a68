//! Advisory synthesizer: compose coherent guidance from gated advice.
//!
//! Two tiers. Programmatic composition uses templates and priority rules,
//! costs nothing, and is always available. AI-enhanced composition walks
//! the provider fallback chain under a strict per-call timeout and falls
//! back to programmatic in `auto` mode. Results are cached briefly keyed
//! by the (phase, intent, tool, advice ids) tuple.
//!
//! An optional tone-strategy overlay adjusts presentation (opener line,
//! bullet budget) without ever changing which items are emitted.

use crate::config::{SynthMode, SynthesizerConfig};
use crate::home::SparkHome;
use crate::jsonl::read_json_file;
use crate::providers::{provider_chain, Provider};
use crate::types::{Advice, Authority, TaskPhase};
use crate::util::{now_ts, sha1_hex};
use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const MIN_AI_RESPONSE_CHARS: usize = 10;
const MAX_CAUTIONS: usize = 2;

static LEADING_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[[^\]]{1,24}\]\s*").unwrap());
static THINK_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());

/// Presentation strategy read from an optional overlay file. Shapes tone
/// and pacing only; must never introduce autonomous goals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToneStrategy {
    #[serde(default)]
    pub response_pace: String,
    #[serde(default)]
    pub verbosity: String,
    #[serde(default)]
    pub tone_shape: String,
    #[serde(default)]
    pub ask_clarifying_question: bool,
}

impl ToneStrategy {
    fn opener(&self) -> Option<&'static str> {
        match self.tone_shape.as_str() {
            "calm_focus" => Some("Calm focus:"),
            "reassuring_and_clear" => Some("Steady and clear:"),
            "grounded_warm" => Some("Grounded:"),
            _ => None,
        }
    }

    /// Bullet budget for the context section.
    fn note_budget(&self) -> usize {
        match self.response_pace.as_str() {
            "slow" => 2,
            "lively" => 4,
            _ => 3,
        }
    }
}

fn load_strategy(home: &SparkHome) -> Option<ToneStrategy> {
    let doc = read_json_file(&home.strategy_file())?;
    let strategy = doc.get("strategy").unwrap_or(&doc);
    serde_json::from_value(strategy.clone()).ok()
}

struct CacheEntry {
    created_ts: f64,
    text: String,
}

/// Composes emitted advice into at most one short advisory block.
pub struct Synthesizer {
    pub cfg: SynthesizerConfig,
    providers: Vec<Box<dyn Provider>>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    strategy: Option<ToneStrategy>,
}

impl Synthesizer {
    pub fn new(home: &SparkHome, cfg: SynthesizerConfig) -> Self {
        let capacity =
            NonZeroUsize::new(cfg.max_cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            providers: provider_chain(&cfg.preferred_provider),
            cache: Mutex::new(LruCache::new(capacity)),
            strategy: load_strategy(home),
            cfg,
        }
    }

    /// Test/embedding constructor with an explicit provider chain.
    pub fn with_providers(
        cfg: SynthesizerConfig,
        providers: Vec<Box<dyn Provider>>,
        strategy: Option<ToneStrategy>,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(cfg.max_cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { providers, cache: Mutex::new(LruCache::new(capacity)), strategy, cfg }
    }

    /// Compose advisory text from emitted items. Returns an empty string
    /// when there is nothing worth saying.
    pub async fn synthesize(
        &self,
        items: &[Advice],
        phase: TaskPhase,
        user_intent: &str,
        tool_name: &str,
        force_mode: Option<SynthMode>,
    ) -> String {
        if items.is_empty() {
            return String::new();
        }
        let mode = force_mode.unwrap_or(self.cfg.mode);
        let key = self.cache_key(phase, user_intent, tool_name, items);
        if let Some(text) = self.cache_get(&key) {
            return text;
        }

        let text = match mode {
            SynthMode::Programmatic => self.synthesize_programmatic(items),
            SynthMode::AiOnly => self.synthesize_ai(items, phase, user_intent, tool_name).await,
            SynthMode::Auto => {
                let ai = self.synthesize_ai(items, phase, user_intent, tool_name).await;
                if ai.is_empty() {
                    self.synthesize_programmatic(items)
                } else {
                    ai
                }
            }
        };

        if !text.is_empty() {
            self.cache_put(key, text.clone());
        }
        text
    }

    /// Tier 1: template composition. Always available, zero dependencies.
    pub fn synthesize_programmatic(&self, items: &[Advice]) -> String {
        let warnings: Vec<&Advice> = items
            .iter()
            .filter(|i| i.authority == Some(Authority::Warning))
            .collect();
        let notes: Vec<&Advice> = items
            .iter()
            .filter(|i| matches!(i.authority, Some(Authority::Note) | None))
            .collect();
        if warnings.is_empty() && notes.is_empty() {
            return String::new();
        }

        let strategy = self.strategy.clone().unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        if let Some(opener) = strategy.opener() {
            lines.push(opener.to_string());
        }

        if !warnings.is_empty() {
            lines.push("Cautions:".to_string());
            for item in warnings.iter().take(MAX_CAUTIONS) {
                let mut line = format!("- {}", strip_leading_tag(&item.text));
                if item.confidence >= 0.7 {
                    line.push_str(" (high confidence)");
                }
                lines.push(line);
            }
        }

        if !notes.is_empty() {
            lines.push("Relevant context:".to_string());
            for item in notes.iter().take(strategy.note_budget()) {
                lines.push(format!("- {}", strip_leading_tag(&item.text)));
            }
        }

        if strategy.ask_clarifying_question {
            lines.push("If this doesn't match your intent, say so and I'll adjust.".to_string());
        }

        lines.join("\n")
    }

    /// Tier 2: walk the provider chain; first non-trivial response wins.
    async fn synthesize_ai(
        &self,
        items: &[Advice],
        phase: TaskPhase,
        user_intent: &str,
        tool_name: &str,
    ) -> String {
        let prompt = self.build_synthesis_prompt(items, phase, user_intent, tool_name);
        let timeout = Duration::from_secs_f64(self.cfg.ai_timeout_s);
        for provider in &self.providers {
            match provider.query(&prompt, timeout).await {
                Ok(text) => {
                    let cleaned = sanitize_ai_text(&text);
                    if cleaned.chars().count() >= MIN_AI_RESPONSE_CHARS {
                        debug!(provider = provider.name(), "AI synthesis succeeded");
                        return cleaned;
                    }
                }
                Err(e) => {
                    debug!(provider = provider.name(), "provider failed, trying next: {e}");
                }
            }
        }
        String::new()
    }

    fn build_synthesis_prompt(
        &self,
        items: &[Advice],
        phase: TaskPhase,
        user_intent: &str,
        tool_name: &str,
    ) -> String {
        let mut prompt = String::from(
            "Compose one short advisory (1-2 plain-text sentences, no markdown) \
             for an AI coding assistant about to use a tool.\n",
        );
        prompt.push_str(&format!("Phase: {}\n", phase.as_str()));
        prompt.push_str(&format!("Tool: {tool_name}\n"));
        if !user_intent.trim().is_empty() {
            prompt.push_str(&format!("User intent: {}\n", user_intent.trim()));
        }
        prompt.push_str("Insights:\n");
        for item in items.iter().take(5) {
            prompt.push_str(&format!("- {}\n", item.text.trim()));
        }
        if let Some(strategy) = &self.strategy {
            prompt.push_str("Response shaping strategy:\n");
            prompt.push_str(&format!("response_pace: {}\n", strategy.response_pace));
            prompt.push_str(&format!("verbosity: {}\n", strategy.verbosity));
            prompt.push_str(&format!("tone_shape: {}\n", strategy.tone_shape));
        }
        prompt.push_str("Never introduce autonomous goals; stay user-guided.\n");
        prompt
    }

    /// Cache key over the routing-relevant inputs.
    fn cache_key(
        &self,
        phase: TaskPhase,
        user_intent: &str,
        tool_name: &str,
        items: &[Advice],
    ) -> String {
        let intent: String = user_intent.chars().take(100).collect();
        let mut ids: Vec<&str> = items.iter().map(|i| i.advice_id.as_str()).collect();
        ids.sort_unstable();
        ids.truncate(5);
        sha1_hex(&format!(
            "{}|{intent}|{tool_name}|{}",
            phase.as_str(),
            ids.join(",")
        ))
    }

    fn cache_get(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(key)?;
        if now_ts() - entry.created_ts > self.cfg.cache_ttl_s {
            cache.pop(key);
            return None;
        }
        Some(entry.text.clone())
    }

    fn cache_put(&self, key: String, text: String) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, CacheEntry { created_ts: now_ts(), text });
    }

    /// Snapshot for the status surface.
    pub fn status(&self) -> serde_json::Value {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::json!({
            "mode": self.cfg.mode,
            "ai_timeout_s": self.cfg.ai_timeout_s,
            "providers": self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "cache_entries": cache.len(),
            "strategy_overlay": self.strategy.is_some(),
        })
    }
}

fn strip_leading_tag(text: &str) -> String {
    LEADING_TAG_RE.replace(text.trim(), "").to_string()
}

/// Drop markdown bold, code fences, and thinking tags from AI output.
fn sanitize_ai_text(text: &str) -> String {
    let cleaned = THINK_BLOCK_RE.replace_all(text, "").replace("**", "");
    cleaned
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
