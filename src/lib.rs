//! Spark Advisory — file-backed advisory engine for AI coding assistants
//!
//! At each tool invocation of a host assistant, the engine decides whether
//! to emit one short piece of guidance to steer the model's next action.
//! It fuses multi-source memory, predicts reusable guidance via a
//! content-addressed packet cache, gates candidates through a multi-filter
//! authority model, optionally synthesizes natural-language output, and
//! emits at most one concise string within a strict time budget.
//!
//! # Architecture
//!
//! - **Types**: advice, packets, gate decisions, intent taxonomy
//! - **State**: persistent per-session context with TTL
//! - **Fusion**: evidence bundle across optional memory sources
//! - **Store**: content-addressed packet cache with exact/relaxed lookup
//! - **Gate**: cooldowns, dedup, suppression, authority, emission budget
//! - **Synthesizer**: programmatic + AI provider chain with fallback
//! - **Engine**: the three host hooks, wired together
//!
//! # Example
//!
//! ```ignore
//! use spark_advisory::{AdvisoryEngine, SparkHome};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = AdvisoryEngine::new(SparkHome::resolve());
//!     engine.on_user_prompt("session-1", "harden the auth flow").await;
//!     if let Some(text) = engine.on_pre_tool("session-1", "Edit", None, None).await {
//!         println!("advisory: {text}");
//!     }
//!     engine.on_post_tool("session-1", "Edit", true, None, None, None).await;
//! }
//! ```

pub mod advisor;
pub mod api; // localhost status surface
pub mod cli;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod gate;
pub mod home;
pub mod intent;
pub mod jsonl; // bounded JSONL and atomic JSON helpers
pub mod prefetch;
pub mod providers;
pub mod state;
pub mod store;
pub mod synthesizer;
pub mod types;
pub mod util;

// Re-export the surface most hosts need.
pub use config::{GuidanceStyle, MemoryMode, SynthMode, Tuneables};
pub use emitter::{AdvisorySink, Emitter, StdoutSink};
pub use engine::{baseline_text, session_lineage, AdvisoryEngine};
pub use error::{Result, SparkError};
pub use fusion::{MemoryBundle, MemoryFusion};
pub use gate::Gate;
pub use home::SparkHome;
pub use intent::{build_session_context_key, map_intent, IntentResult};
pub use prefetch::PrefetchWorker;
pub use state::{SessionState, StateStore};
pub use store::{PacketDraft, PacketStore};
pub use synthesizer::Synthesizer;
pub use types::{
    Advice, AdviceSource, Authority, GateDecision, GateResult, IntentFamily, Packet, SourceMode,
    TaskPhase, TaskPlane,
};
