//! LlmClient trait definition

use async_trait::async_trait;

use super::{ChatMessage, CompletionOverrides, CompletionResponse, LlmError};

/// Stateless LLM client - each call is independent
///
/// This is the core abstraction for talking to language models. Conversation
/// state lives with the callers (planner and subplanner conversations); the
/// client just executes one completion at a time and is safe for concurrent
/// use from many workers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one completion request with the configured defaults
    async fn complete(&self, messages: &[ChatMessage]) -> Result<CompletionResponse, LlmError> {
        self.complete_with(messages, CompletionOverrides::default()).await
    }

    /// Send one completion request with per-call parameter overrides
    async fn complete_with(
        &self,
        messages: &[ChatMessage],
        overrides: CompletionOverrides,
    ) -> Result<CompletionResponse, LlmError>;

    /// Total tokens consumed across all calls so far
    fn total_tokens_used(&self) -> u64 {
        0
    }

    /// Total API requests issued so far
    fn total_requests(&self) -> u64 {
        0
    }
}
