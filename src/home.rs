//! Spark home directory layout.
//!
//! Every persistent surface lives under a single root (`~/.spark` by
//! default, `SPARK_HOME` override for tests and containers). Components
//! receive a [`SparkHome`] instead of computing paths themselves so tests
//! can isolate the whole engine inside a temp directory.

use std::path::{Path, PathBuf};

/// Root of the on-disk resource space shared by all advisory components.
#[derive(Debug, Clone)]
pub struct SparkHome {
    root: PathBuf,
}

impl SparkHome {
    /// Resolve the home directory: `SPARK_HOME` env var, else `~/.spark`.
    pub fn resolve() -> Self {
        if let Ok(path) = std::env::var("SPARK_HOME") {
            if !path.trim().is_empty() {
                return Self { root: PathBuf::from(path) };
            }
        }
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self { root: base.join(".spark") }
    }

    /// Use an explicit root (tests, embedded hosts).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-session advisory state documents.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("advisory_state")
    }

    /// Packet store directory (`<packet_id>.json`, index, queue, worker state).
    pub fn packet_dir(&self) -> PathBuf {
        self.root.join("advice_packets")
    }

    pub fn index_file(&self) -> PathBuf {
        self.packet_dir().join("index.json")
    }

    pub fn prefetch_queue_file(&self) -> PathBuf {
        self.packet_dir().join("prefetch_queue.jsonl")
    }

    pub fn prefetch_worker_state_file(&self) -> PathBuf {
        self.packet_dir().join("prefetch_worker_state.json")
    }

    pub fn tuneables_file(&self) -> PathBuf {
        self.root.join("tuneables.json")
    }

    pub fn engine_log(&self) -> PathBuf {
        self.root.join("advisory_engine.jsonl")
    }

    pub fn emit_log(&self) -> PathBuf {
        self.root.join("advisory_emit.jsonl")
    }

    /// Cross-session dedupe ledger of recently emitted advice.
    pub fn dedupe_log(&self) -> PathBuf {
        self.root.join("advisory_dedupe.jsonl")
    }

    pub fn feedback_requests_log(&self) -> PathBuf {
        self.root.join("advice_feedback_requests.jsonl")
    }

    pub fn feedback_state_file(&self) -> PathBuf {
        self.root.join("advice_feedback_state.json")
    }

    pub fn outcomes_log(&self) -> PathBuf {
        self.root.join("outcomes.jsonl")
    }

    // Memory fusion inputs.

    pub fn cognitive_file(&self) -> PathBuf {
        self.root.join("cognitive_insights.json")
    }

    pub fn chip_insights_dir(&self) -> PathBuf {
        self.root.join("chip_insights")
    }

    pub fn eidos_file(&self) -> PathBuf {
        self.root.join("eidos_distillations.jsonl")
    }

    pub fn handoffs_file(&self) -> PathBuf {
        self.root.join("orchestration").join("handoffs.jsonl")
    }

    /// Optional tone-strategy overlay consumed by the synthesizer.
    pub fn strategy_file(&self) -> PathBuf {
        self.root.join("strategy.json")
    }

    /// Create the directories writers rely on.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.packet_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_under_root() {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path());
        assert!(home.index_file().starts_with(dir.path()));
        assert_eq!(
            home.prefetch_queue_file().parent(),
            Some(home.packet_dir().as_path())
        );
    }

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let dir = TempDir::new().unwrap();
        let home = SparkHome::at(dir.path().join("deep"));
        home.ensure_dirs().unwrap();
        assert!(home.state_dir().is_dir());
        assert!(home.packet_dir().is_dir());
    }
}
