//! SQL generator client
//!
//! `SqlGenerator` is the seam to the external language model. `LlmClient`
//! speaks the OpenAI-compatible chat-completions protocol.

use crate::config::GeneratorConfig;
use crate::error::GenerationFault;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_context: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationFault>;
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let mut client = Self::new(api_key, config.model.clone(), config.base_url.clone());
        client.timeout = config.timeout;
        Some(client)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, request: &GenerationRequest) -> Result<String, GenerationFault> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_context},
                {"role": "user", "content": request.user_prompt}
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationFault::Timeout(self.timeout.as_millis() as u64)
                } else {
                    GenerationFault::Transport(format!("LLM API call failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationFault::Transport(format!(
                "LLM API returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationFault::Transport(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(GenerationFault::EmptyResponse)?;

        debug!("LLM returned {} chars", content.len());
        Ok(content.to_string())
    }
}

#[async_trait]
impl SqlGenerator for LlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationFault> {
        self.call_llm(request).await
    }
}
