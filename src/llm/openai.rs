//! OpenAI-compatible chat completions client
//!
//! Works against any endpoint that speaks the OpenAI chat completions
//! protocol (Gemini's compatibility layer included). Some gateways wrap the
//! response body in a one-element array or return an `error` object with a
//! 200 status; both shapes are handled here so callers only ever see
//! [`LlmError`] variants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::{ChatMessage, CompletionOverrides, CompletionResponse, LlmClient, LlmError};
use crate::config::LlmConfig;

/// OpenAI-compatible API client
pub struct OpenAIClient {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    http: Client,
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
}

impl OpenAIClient {
    /// Create a new client from configuration
    ///
    /// The API key is resolved from the environment variable named in the
    /// config; a missing key is an immediate error rather than a deferred 401.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(base_url = %config.base_url, model = %config.model, "OpenAIClient::from_config: called");
        let api_key = config.api_key().map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            http,
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
        })
    }

    fn build_request_body(&self, messages: &[ChatMessage], overrides: &CompletionOverrides) -> Value {
        json!({
            "model": overrides.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "temperature": overrides.temperature.unwrap_or(self.temperature),
            "max_tokens": overrides.max_tokens.unwrap_or(self.max_tokens),
        })
    }

    /// Extract a completion from a decoded response body
    fn parse_response(&self, raw: Value, latency_ms: u64) -> Result<CompletionResponse, LlmError> {
        // Some gateways wrap the whole response in a one-element array.
        let data = match raw {
            Value::Array(mut arr) if !arr.is_empty() => arr.remove(0),
            other => other,
        };

        // An error object with no choices means the call failed despite a 200.
        if data.get("error").is_some() && data.get("choices").is_none() {
            let err = &data["error"];
            let code = err.get("code").and_then(Value::as_u64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            if code == 429 {
                return Err(LlmError::RateLimited(message));
            }
            return Err(LlmError::Api {
                status: code as u16,
                message,
            });
        }

        let usage = data.get("usage").cloned().unwrap_or_else(|| json!({}));
        let total_tokens = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0);
        self.total_tokens.fetch_add(total_tokens, Ordering::Relaxed);

        let choice = data
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::InvalidResponse(format!("No choices in response: {}", truncate(&data, 500))))?;

        let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .or_else(|| message.get("text").and_then(Value::as_str))
            .unwrap_or("")
            .to_string();

        if content.is_empty() {
            return Err(LlmError::InvalidResponse(format!(
                "Empty content in response: {}",
                truncate(&data, 500)
            )));
        }

        Ok(CompletionResponse {
            content,
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            total_tokens,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            latency_ms,
        })
    }
}

fn truncate(value: &Value, max: usize) -> String {
    let mut s = value.to_string();
    if s.len() > max {
        let cut = s.char_indices().nth(max).map(|(i, _)| i).unwrap_or(s.len());
        s.truncate(cut);
    }
    s
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete_with(
        &self,
        messages: &[ChatMessage],
        overrides: CompletionOverrides,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(messages, &overrides);
        let start = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        debug!(
            %url,
            message_count = messages.len(),
            chars = messages.iter().map(|m| m.content.len()).sum::<usize>(),
            "complete_with: sending request"
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Network)?;

        let status = response.status().as_u16();

        if status == 429 {
            let text = response.text().await.unwrap_or_default();
            debug!("complete_with: rate limited (429)");
            return Err(LlmError::RateLimited(text.chars().take(500).collect()));
        }

        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            debug!(%status, "complete_with: API error");
            return Err(LlmError::Api {
                status,
                message: text.chars().take(1000).collect(),
            });
        }

        let raw: Value = response.json().await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let parsed = self.parse_response(raw, latency_ms)?;

        debug!(
            chars = parsed.content.len(),
            tokens = parsed.total_tokens,
            latency_ms,
            finish = %parsed.finish_reason,
            "complete_with: response received"
        );

        Ok(parsed)
    }

    fn total_tokens_used(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}
