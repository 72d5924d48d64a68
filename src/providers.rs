//! LLM provider adapters for AI-enhanced synthesis.
//!
//! Each adapter implements one async `query(prompt, timeout)`; the
//! synthesizer walks an ordered chain and takes the first non-empty
//! response. Failures and timeouts mean "try the next provider", never an
//! error the engine sees. Keys and endpoints come from the environment so
//! a missing provider simply drops out of the chain.

use crate::error::{Result, SparkError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One LLM backend in the synthesis fallback chain.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send one prompt; the implementation must respect `timeout`.
    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(2)))
        .build()?)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Local Ollama daemon.
pub struct OllamaProvider {
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn from_env() -> Self {
        Self {
            base_url: env_nonempty("OLLAMA_HOST")
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
            model: env_nonempty("SPARK_OLLAMA_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let client = http_client(timeout)?;
        let response = client
            .post(format!("{}/api/generate", self.base_url.trim_end_matches('/')))
            .json(&OllamaRequest { model: &self.model, prompt, stream: false })
            .send()
            .await?
            .error_for_status()?;
        let body: OllamaResponse = response.json().await?;
        Ok(body.response.trim().to_string())
    }
}

/// Google Gemini.
pub struct GeminiProvider {
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: env_nonempty("GEMINI_API_KEY")?,
            model: env_nonempty("SPARK_GEMINI_MODEL")
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let client = http_client(timeout)?;
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let response = client.post(&url).json(&payload).send().await?.error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(text)
    }
}

/// OpenAI chat completions.
pub struct OpenAiProvider {
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: env_nonempty("OPENAI_API_KEY")?,
            model: env_nonempty("SPARK_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let client = http_client(timeout)?;
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 256,
        });
        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(text)
    }
}

/// Anthropic messages API.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: env_nonempty("ANTHROPIC_API_KEY")?,
            model: env_nonempty("SPARK_ANTHROPIC_MODEL")
                .unwrap_or_else(|| "claude-haiku-4-5-20251001".to_string()),
        })
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let client = http_client(timeout)?;
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: 256,
            messages: vec![AnthropicMessage { role: "user", content: prompt }],
        };
        let response = client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: AnthropicResponse = response.json().await?;
        Ok(body
            .content
            .first()
            .map(|c| c.text.trim().to_string())
            .unwrap_or_default())
    }
}

/// Shell out to a local `claude` CLI, killed on timeout.
pub struct ClaudeCliProvider;

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &'static str {
        "claude-cli"
    }

    async fn query(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let child = tokio::process::Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SparkError::Provider(format!("claude CLI spawn failed: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SparkError::ProviderTimeout(timeout.as_millis() as u64))?
            .map_err(|e| SparkError::Provider(format!("claude CLI failed: {e}")))?;

        if !output.status.success() {
            return Err(SparkError::Provider(format!(
                "claude CLI exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Build the fallback chain: `[preferred] → ollama → gemini → openai →
/// anthropic → claude-cli`. Providers without credentials are skipped.
pub fn provider_chain(preferred: &str) -> Vec<Box<dyn Provider>> {
    let mut chain: Vec<Box<dyn Provider>> = Vec::new();
    let push_named = |name: &str, chain: &mut Vec<Box<dyn Provider>>| {
        if chain.iter().any(|p| p.name() == name) {
            return;
        }
        match name {
            "ollama" => chain.push(Box::new(OllamaProvider::from_env())),
            "gemini" => {
                if let Some(p) = GeminiProvider::from_env() {
                    chain.push(Box::new(p));
                }
            }
            "openai" => {
                if let Some(p) = OpenAiProvider::from_env() {
                    chain.push(Box::new(p));
                }
            }
            "anthropic" => {
                if let Some(p) = AnthropicProvider::from_env() {
                    chain.push(Box::new(p));
                }
            }
            "claude-cli" => chain.push(Box::new(ClaudeCliProvider)),
            other => debug!(provider = other, "unknown preferred provider ignored"),
        }
    };

    if !preferred.is_empty() && preferred != "auto" {
        push_named(preferred, &mut chain);
    }
    for name in ["ollama", "gemini", "openai", "anthropic", "claude-cli"] {
        push_named(name, &mut chain);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_with_preferred() {
        let chain = provider_chain("claude-cli");
        assert_eq!(chain[0].name(), "claude-cli");
        // No duplicate entries for the preferred provider.
        assert_eq!(
            chain.iter().filter(|p| p.name() == "claude-cli").count(),
            1
        );
    }

    #[test]
    fn test_chain_auto_starts_with_ollama() {
        let chain = provider_chain("auto");
        assert_eq!(chain[0].name(), "ollama");
        assert_eq!(chain.last().unwrap().name(), "claude-cli");
    }

    #[test]
    fn test_unknown_preferred_ignored() {
        let chain = provider_chain("minimax");
        assert_eq!(chain[0].name(), "ollama");
    }

    #[tokio::test]
    async fn test_ollama_unreachable_is_error_not_panic() {
        let provider = OllamaProvider {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "x".to_string(),
        };
        let result = provider.query("hello", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
