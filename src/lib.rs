// src/lib.rs

// Import the top-level `wealthcoach` module.
pub mod wealthcoach;

// Re-export the submodules at the crate root so callers write
// `wealthcoach::chat_service::ChatService` instead of navigating the whole
// hierarchy.
pub use wealthcoach::{
    auth, background, cache, chat_service, client_wrapper, clients, config, conversation,
    embedding, error, http_api, prompt, rate_limit, retriever, vector_store, ws,
};

// Re-exporting key items for easier external access.
pub use wealthcoach::chat_service::{
    ChatEvent, ChatRequest, ChatResponse, ChatService, StreamingHandle,
};
pub use wealthcoach::client_wrapper::{LlmClient, Message, Role};
pub use wealthcoach::config::Settings;
pub use wealthcoach::error::CoreError;

/// Initialise the process logger from `RUST_LOG`. Safe to call repeatedly;
/// later calls are no-ops, so tests can each call it.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
