//! CLI command implementations.
//!
//! The binary is wired into the host as three hook subcommands reading the
//! hook payload JSON from stdin, plus operator commands for status, the
//! prefetch worker, preferences, and the localhost status API.

use crate::config::{GuidanceStyle, MemoryMode, Tuneables};
use crate::engine::AdvisoryEngine;
use crate::home::SparkHome;
use crate::prefetch::PrefetchWorker;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;

/// Hook payload as delivered by the host on stdin.
///
/// Field names follow the host's hook event schema; everything is optional
/// so a partial payload still routes.
#[derive(Debug, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default, alias = "user_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Read and parse the hook payload from stdin. A malformed payload yields
/// the default payload — hooks must never fail the host.
pub fn read_hook_payload() -> HookPayload {
    let mut raw = String::new();
    if std::io::stdin().read_to_string(&mut raw).is_err() {
        return HookPayload::default();
    }
    serde_json::from_str(&raw).unwrap_or_default()
}

fn session_or_default(payload: &HookPayload) -> String {
    if payload.session_id.trim().is_empty() {
        "default_session".to_string()
    } else {
        payload.session_id.clone()
    }
}

/// `hook user-prompt`
pub async fn run_user_prompt_hook(home: SparkHome) {
    let payload = read_hook_payload();
    let engine = AdvisoryEngine::new(home);
    engine
        .on_user_prompt(&session_or_default(&payload), &payload.prompt)
        .await;
}

/// `hook pre-tool` — the advisory itself goes to stdout via the emitter.
pub async fn run_pre_tool_hook(home: SparkHome) {
    let payload = read_hook_payload();
    if payload.tool_name.trim().is_empty() {
        return;
    }
    let engine = AdvisoryEngine::new(home);
    let _ = engine
        .on_pre_tool(
            &session_or_default(&payload),
            &payload.tool_name,
            payload.tool_input.as_ref(),
            payload.trace_id.as_deref(),
        )
        .await;
}

/// `hook post-tool`
pub async fn run_post_tool_hook(home: SparkHome) {
    let payload = read_hook_payload();
    if payload.tool_name.trim().is_empty() {
        return;
    }
    let engine = AdvisoryEngine::new(home);
    engine
        .on_post_tool(
            &session_or_default(&payload),
            &payload.tool_name,
            payload.success.unwrap_or(true),
            payload.tool_input.as_ref(),
            payload.trace_id.as_deref(),
            payload.error.as_deref(),
        )
        .await;
}

/// `status`
pub fn run_status(home: SparkHome) {
    let engine = AdvisoryEngine::new(home);
    match serde_json::to_string_pretty(&engine.status()) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("status unavailable: {e}"),
    }
}

/// `prefetch run|pause|resume|status`
pub fn run_prefetch(home: SparkHome, action: &str, reason: &str) {
    let tuneables = Tuneables::load(&home);
    let engine = AdvisoryEngine::new(home.clone());
    let worker = PrefetchWorker::new(&home, tuneables.prefetch);
    let output = match action {
        "run" => {
            let result = worker.process_queue(engine.packet_store(), None, None);
            serde_json::to_value(result).unwrap_or(Value::Null)
        }
        "pause" => {
            worker.set_paused(true, reason);
            worker.status(engine.packet_store())
        }
        "resume" => {
            worker.set_paused(false, "");
            worker.status(engine.packet_store())
        }
        _ => worker.status(engine.packet_store()),
    };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("prefetch output unavailable: {e}"),
    }
}

/// `config show`
pub fn run_config_show(home: SparkHome) {
    let tuneables = Tuneables::load(&home);
    match serde_json::to_string_pretty(&tuneables.to_document()) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("config unavailable: {e}"),
    }
}

/// `config set-preferences`
pub fn run_set_preferences(home: SparkHome, memory_mode: &str, guidance_style: &str) {
    let mut tuneables = Tuneables::load(&home);
    tuneables.apply_preferences(
        MemoryMode::parse(memory_mode),
        GuidanceStyle::parse(guidance_style),
    );
    match tuneables.save(&home) {
        Ok(()) => println!(
            "preferences saved: memory_mode={} guidance_style={}",
            tuneables.preferences.memory_mode.as_str(),
            tuneables.preferences.guidance_style.as_str()
        ),
        Err(e) => eprintln!("failed to save preferences: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_payload_decodes_partial_json() {
        let payload: HookPayload =
            serde_json::from_str(r#"{"session_id": "s1", "tool_name": "Edit"}"#).unwrap();
        assert_eq!(payload.session_id, "s1");
        assert_eq!(payload.tool_name, "Edit");
        assert!(payload.tool_input.is_none());
        assert!(payload.success.is_none());
    }

    #[test]
    fn test_hook_payload_user_prompt_alias() {
        let payload: HookPayload =
            serde_json::from_str(r#"{"session_id": "s1", "user_prompt": "fix auth"}"#).unwrap();
        assert_eq!(payload.prompt, "fix auth");
    }

    #[test]
    fn test_session_fallback() {
        let payload = HookPayload::default();
        assert_eq!(session_or_default(&payload), "default_session");
    }
}
