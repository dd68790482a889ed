//! Error taxonomy shared across the chat serving core.
//!
//! Components keep their own small error enums at the seams
//! ([`crate::wealthcoach::embedding::EmbeddingError`],
//! [`crate::wealthcoach::vector_store::VectorStoreError`],
//! [`crate::wealthcoach::client_wrapper::LlmError`]) and convert into
//! [`CoreError`] at the service boundary, where the variant decides how the
//! failure is surfaced to a client.

use thiserror::Error;

/// Service-level error kinds.
///
/// The variants map one-to-one onto the externally observable failure modes:
/// `Input` and `NotFound` are the caller's problem, `Auth` deliberately
/// carries no detail about which sub-check failed, `RateLimited` includes a
/// retry hint, `Transient` means "try again", and `Fatal` means corrupt state
/// was detected and the affected handle must be closed.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("authentication failed")]
    Auth,

    #[error("not found")]
    NotFound,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// The consumer went away mid-operation. Not an error condition; callers
    /// stop quietly.
    #[error("canceled")]
    Canceled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether a caller may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::RateLimited { .. }
        )
    }

    /// HTTP status code equivalent used by the REST surface.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Input(_) => 400,
            CoreError::Auth => 401,
            CoreError::NotFound => 404,
            CoreError::RateLimited { .. } => 429,
            CoreError::Transient(_) => 503,
            CoreError::Canceled => 499,
            CoreError::Fatal(_) => 500,
        }
    }
}
