//! Shared primitives for provider-agnostic LLM clients.
//!
//! The [`LlmClient`] trait abstracts over concrete model endpoints while the
//! supporting structs describe chat messages, streaming chunks, and token
//! accounting. Conversation bookkeeping lives in the chat service; clients
//! only translate requests into the provider wire format.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use thiserror::Error;

use crate::wealthcoach::error::CoreError;

/// Roles a chat message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Primes or constrains assistant behaviour.
    System,
    /// A human end-user turn.
    User,
    /// A model response (or exemplar).
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A generic message sent to an LLM.
///
/// Content is stored as `Arc<str>` so assembled prompts can be cheaply
/// cloned into retry paths and background persistence.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
}

impl Message {
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Prompt vs. completion token accounting as billed by the provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Result of a synchronous completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
    /// Whether the content was served from the response cache without
    /// invoking the model.
    pub cached: bool,
}

/// One incremental chunk of a streaming response.
#[derive(Debug, Clone)]
pub struct MessageChunk {
    /// Content delta. May be empty for chunks that only carry a finish
    /// reason.
    pub content: String,
    /// Provider finish status (e.g. `"stop"`) on the terminal chunk.
    pub finish_reason: Option<String>,
}

/// A finite, single-pass stream of chunks. Not restartable; callers that
/// need the full text after end-of-stream accumulate it as they consume.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, LlmError>> + Send>>;

#[derive(Debug, Error)]
pub enum LlmError {
    /// The endpoint cannot be reached or returned a server error. Retriable.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// The assembled prompt exceeds what the model accepts. The caller must
    /// shorten; retrying unchanged cannot succeed.
    #[error("context too long: estimated {estimated} tokens over budget {budget}")]
    ContextTooLong { estimated: usize, budget: usize },

    /// The consumer went away. Not an error; handled silently.
    #[error("canceled")]
    Canceled,

    /// The provider answered with something we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<LlmError> for CoreError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Unavailable(msg) => CoreError::Transient(msg),
            LlmError::ContextTooLong { .. } => CoreError::Input(e.to_string()),
            LlmError::Canceled => CoreError::Canceled,
            LlmError::Protocol(msg) => CoreError::Transient(msg),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CompletionOpts {
    /// Response-cache key for the synchronous path. When set, `complete`
    /// checks the cache before invoking the model and stores the response on
    /// a clean finish. Streaming ignores it; the orchestrator caches the
    /// concatenated text after end-of-stream instead.
    pub cache_key: Option<String>,
}

/// Interface to a chat-completion capable model endpoint.
///
/// Implementations must be `Send + Sync` so they can be shared between
/// connection tasks. They must not reorder or de-duplicate messages.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single-shot request/response completion.
    async fn complete(
        &self,
        messages: &[Message],
        opts: &CompletionOpts,
    ) -> Result<Completion, LlmError>;

    /// Lazy token stream: zero or more non-empty deltas followed by a
    /// terminal chunk. Dropping the stream cancels the upstream request.
    async fn complete_stream(&self, messages: &[Message]) -> Result<MessageChunkStream, LlmError>;

    /// Identifier of the upstream model (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    /// Cheap reachability probe for the detailed health report. Must not
    /// trigger model loading or a generation.
    async fn ping(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Token estimation & truncation
// ---------------------------------------------------------------------------

/// Estimates tokens for a string: one token per 4 characters, minimum 1.
/// Coarse, but consistent with how the budget defaults were picked.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimated tokens for a message, including a fixed cost for the role.
pub fn estimate_message_tokens(message: &Message) -> usize {
    1 + estimate_tokens(&message.content)
}

/// Estimated tokens for an assembled prompt.
pub fn estimate_prompt_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Drop oldest non-system messages until the estimate fits `budget`.
///
/// System messages and the final message (the user's question) are always
/// preserved, so the result can still exceed the budget when those alone are
/// too large; the model's own limit is the backstop in that case.
pub fn truncate_to_budget(messages: Vec<Message>, budget: usize) -> Vec<Message> {
    let mut messages = messages;
    let mut total = estimate_prompt_tokens(&messages);
    while total > budget && messages.len() > 1 {
        let candidate = messages
            .iter()
            .enumerate()
            .take(messages.len() - 1)
            .find(|(_, m)| m.role != Role::System)
            .map(|(i, _)| i);
        match candidate {
            Some(i) => {
                let removed = messages.remove(i);
                total -= estimate_message_tokens(&removed);
            }
            None => break,
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        Message::new(role, content)
    }

    #[test]
    fn estimation_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn truncation_drops_oldest_non_system_first() {
        let messages = vec![
            msg(Role::System, &"s".repeat(40)),
            msg(Role::User, &"oldest".repeat(40)),
            msg(Role::Assistant, &"middle".repeat(40)),
            msg(Role::User, "final question"),
        ];
        let budget = estimate_prompt_tokens(&messages) - 1;
        let trimmed = truncate_to_budget(messages, budget);

        assert_eq!(trimmed[0].role, Role::System);
        assert_eq!(trimmed.last().unwrap().content.as_ref(), "final question");
        assert!(!trimmed
            .iter()
            .any(|m| m.content.as_ref().starts_with("oldest")));
    }

    #[test]
    fn truncation_never_drops_system_or_final_user() {
        let messages = vec![
            msg(Role::System, &"persona".repeat(100)),
            msg(Role::User, &"question".repeat(100)),
        ];
        let trimmed = truncate_to_budget(messages, 1);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].role, Role::System);
        assert_eq!(trimmed[1].role, Role::User);
    }

    #[test]
    fn within_budget_is_untouched() {
        let messages = vec![
            msg(Role::System, "short"),
            msg(Role::User, "q1"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "q2"),
        ];
        let trimmed = truncate_to_budget(messages.clone(), 10_000);
        assert_eq!(trimmed.len(), messages.len());
    }
}
