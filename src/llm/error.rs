//! LLM error types

use thiserror::Error;

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Check if this is a rate limit error
    ///
    /// Rate limits are the one transport failure the worker pool retries.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
    }

    /// Check if this error is worth retrying at all
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited(_) => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Network(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::Json(_) => false,
        }
    }
}
