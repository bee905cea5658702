//! LLM client module for CodeSwarm
//!
//! Provides the client trait, the OpenAI-compatible HTTP implementation,
//! and shared request/response types.

use std::sync::Arc;

use tracing::debug;

pub mod client;
mod error;
mod openai;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use types::{ChatMessage, CompletionOverrides, CompletionResponse, Role};

use crate::config::LlmConfig;

/// Create the LLM client from configuration
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(base_url = %config.base_url, model = %config.model, "create_client: called");
    Ok(Arc::new(OpenAIClient::from_config(config)?))
}
