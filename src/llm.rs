//! Completion capability
//!
//! The synthesizer only needs "prompt in, text out". [`LlmClient`] provides that
//! over an OpenAI-compatible `/chat/completions` endpoint; tests inject their
//! own [`CompletionProvider`].

use crate::config::LlmConfig;
use crate::error::{GeoSqlError, Result};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Complete `prompt`; `context` is the system instruction.
    async fn complete(&self, prompt: &str, context: &str) -> Result<String>;
}

pub struct LlmClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            GeoSqlError::Config("no completion API key; set OPENAI_API_KEY".to_string())
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GeoSqlError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": context},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": 800
        });

        debug!("Requesting completion from {} ({} prompt chars)", self.model, prompt.len());
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GeoSqlError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GeoSqlError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let message = response_json["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(GeoSqlError::Llm(format!("LLM API returned {}: {}", status, message)));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GeoSqlError::Llm("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}
