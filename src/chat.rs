//! Chat-completion backends used to generate answers.
//!
//! - **[`OllamaChat`]**: `POST /api/chat` on a local Ollama instance.
//! - **[`OpenAIChat`]**: `POST /chat/completions` on any OpenAI-compatible server.
//!
//! Both reuse the embedding module's retry policy.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ChatConfig;
use crate::embedding::post_json_with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Backend identifier (`"ollama"`, `"openai"`, ...).
    fn backend(&self) -> &str;
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ Ollama ============

pub struct OllamaChat {
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &ChatConfig, model: &str) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model: model.to_string(),
            url: url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatProvider for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn backend(&self) -> &str {
        "ollama"
    }
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(strip_reasoning)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAIChat {
    model: String,
    url: String,
    api_key: Option<String>,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    /// The API key comes from `OPENAI_API_KEY` and may be absent for local servers.
    pub fn new(config: &ChatConfig, model: &str) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            model: model.to_string(),
            url: url.trim_end_matches('/').to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn backend(&self) -> &str {
        "openai"
    }
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/chat/completions", self.url),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(strip_reasoning)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
    }
}

/// Drop a leading `<think>...</think>` block emitted by reasoning models.
fn strip_reasoning(text: &str) -> String {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim().to_string();
        }
    }
    text.trim().to_string()
}

/// Create the chat provider named by `[chat].provider`, serving `model`.
pub fn create_chat_provider(config: &ChatConfig, model: &str) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaChat::new(config, model)?)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config, model)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}
