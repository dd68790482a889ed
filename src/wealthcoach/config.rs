//! Runtime configuration for the chat serving core.
//!
//! All knobs are read once at startup from environment variables into a
//! [`Settings`] snapshot that is shared behind an `Arc` for the lifetime of
//! the process. Nothing re-reads the environment after startup, so a running
//! server never changes behavior under its clients.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::wealthcoach::error::CoreError;

/// Immutable configuration snapshot.
///
/// Field defaults follow the reference deployment; every value can be
/// overridden through the environment variable of the same (upper-cased)
/// name, e.g. `RAG_TOP_K=8`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Dimension of embedding vectors. Fixed at schema setup.
    pub embedding_dim: usize,
    /// Default number of passages fetched per retrieval.
    pub rag_top_k: usize,
    /// Similarity floor below which passages are discarded.
    pub rag_threshold: f32,
    /// Combined character budget for retrieved context.
    pub rag_max_ctx_chars: usize,
    /// How many recent messages seed the conversation history.
    pub history_n: usize,
    /// Per-message length cap, in characters.
    pub message_max_chars: usize,
    /// Input token estimate cap for prompt assembly.
    pub token_budget_in: usize,
    /// Per-user chat turns admitted per 60 s window.
    pub chat_limit_per_minute: u64,
    /// Parallel streaming handles allowed per user.
    pub max_conn_per_user: usize,
    /// Seconds a transport may sit unauthenticated before being closed.
    pub auth_timeout_secs: u64,
    /// Deadline for the parallel profile/history/RAG prefetch.
    pub prefetch_timeout_ms: u64,
    /// TTL for complete cached responses.
    pub response_cache_ttl_secs: u64,
    /// TTL for cached query embeddings.
    pub embedding_cache_ttl_secs: u64,
    /// TTL for cached profile snapshots.
    pub profile_cache_ttl_secs: u64,
    /// TTL for cached history snapshots.
    pub history_cache_ttl_secs: u64,
    /// Bound on any single cache operation.
    pub cache_op_timeout_ms: u64,

    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: String,
    /// Redis connection string; absent means the in-process cache is used.
    pub redis_url: Option<String>,
    /// SQLite connection string for the conversation store.
    pub database_url: String,
    /// Base URL of the OpenAI-compatible chat completions endpoint.
    pub llm_base_url: String,
    /// API key forwarded as a bearer token to the LLM endpoint.
    pub llm_api_key: String,
    /// Model identifier requested from the LLM endpoint.
    pub llm_model: String,
    /// Optional OpenAI-compatible embeddings endpoint. Unset means the
    /// in-process embedding model is used.
    pub embedding_base_url: Option<String>,
    /// Model identifier requested from the embeddings endpoint.
    pub embedding_model: String,
    /// Shared secret used to verify client tokens.
    pub auth_secret: String,
    /// Optional path to a JSON knowledge-base file loaded at startup.
    pub knowledge_base_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            rag_top_k: 5,
            rag_threshold: 0.7,
            rag_max_ctx_chars: 2000,
            history_n: 10,
            message_max_chars: 2000,
            token_budget_in: 3500,
            chat_limit_per_minute: 20,
            max_conn_per_user: 5,
            auth_timeout_secs: 30,
            prefetch_timeout_ms: 800,
            response_cache_ttl_secs: 7200,
            embedding_cache_ttl_secs: 86400,
            profile_cache_ttl_secs: 300,
            history_cache_ttl_secs: 60,
            cache_op_timeout_ms: 200,
            bind_addr: "127.0.0.1:8080".to_string(),
            redis_url: None,
            database_url: "sqlite::memory:".to_string(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            embedding_base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            auth_secret: String::new(),
            knowledge_base_path: None,
        }
    }
}

impl Settings {
    /// Build a snapshot from the process environment, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Settings::default();
        let settings = Settings {
            embedding_dim: parse_var("EMBEDDING_DIM", defaults.embedding_dim)?,
            rag_top_k: parse_var("RAG_TOP_K", defaults.rag_top_k)?,
            rag_threshold: parse_var("RAG_THRESHOLD", defaults.rag_threshold)?,
            rag_max_ctx_chars: parse_var("RAG_MAX_CTX_CHARS", defaults.rag_max_ctx_chars)?,
            history_n: parse_var("HISTORY_N", defaults.history_n)?,
            message_max_chars: parse_var("MESSAGE_MAX_CHARS", defaults.message_max_chars)?,
            token_budget_in: parse_var("TOKEN_BUDGET_IN", defaults.token_budget_in)?,
            chat_limit_per_minute: parse_var(
                "CHAT_LIMIT_PER_MINUTE",
                defaults.chat_limit_per_minute,
            )?,
            max_conn_per_user: parse_var("MAX_CONN_PER_USER", defaults.max_conn_per_user)?,
            auth_timeout_secs: parse_var("AUTH_TIMEOUT_SECS", defaults.auth_timeout_secs)?,
            prefetch_timeout_ms: parse_var("PREFETCH_TIMEOUT_MS", defaults.prefetch_timeout_ms)?,
            response_cache_ttl_secs: parse_var(
                "RESPONSE_CACHE_TTL",
                defaults.response_cache_ttl_secs,
            )?,
            embedding_cache_ttl_secs: parse_var(
                "EMBEDDING_CACHE_TTL",
                defaults.embedding_cache_ttl_secs,
            )?,
            profile_cache_ttl_secs: parse_var(
                "PROFILE_CACHE_TTL",
                defaults.profile_cache_ttl_secs,
            )?,
            history_cache_ttl_secs: parse_var(
                "HISTORY_CACHE_TTL",
                defaults.history_cache_ttl_secs,
            )?,
            cache_op_timeout_ms: parse_var("CACHE_OP_TIMEOUT_MS", defaults.cache_op_timeout_ms)?,
            bind_addr: string_var("BIND_ADDR", &defaults.bind_addr),
            redis_url: optional_var("REDIS_URL"),
            database_url: string_var("DATABASE_URL", &defaults.database_url),
            llm_base_url: string_var("LLM_BASE_URL", &defaults.llm_base_url),
            llm_api_key: string_var("LLM_API_KEY", &defaults.llm_api_key),
            llm_model: string_var("LLM_MODEL", &defaults.llm_model),
            embedding_base_url: optional_var("EMBEDDING_BASE_URL"),
            embedding_model: string_var("EMBEDDING_MODEL", &defaults.embedding_model),
            auth_secret: string_var("AUTH_SECRET", &defaults.auth_secret),
            knowledge_base_path: optional_var("KNOWLEDGE_BASE_PATH"),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.embedding_dim == 0 {
            return Err(CoreError::Input("EMBEDDING_DIM must be positive".into()));
        }
        if self.message_max_chars == 0 {
            return Err(CoreError::Input(
                "MESSAGE_MAX_CHARS must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rag_threshold) {
            return Err(CoreError::Input(
                "RAG_THRESHOLD must be within [0.0, 1.0]".into(),
            ));
        }
        if self.max_conn_per_user == 0 {
            return Err(CoreError::Input("MAX_CONN_PER_USER must be positive".into()));
        }
        Ok(())
    }

    /// Prefetch deadline as a [`Duration`].
    pub fn prefetch_timeout(&self) -> Duration {
        Duration::from_millis(self.prefetch_timeout_ms)
    }

    /// Cache operation bound as a [`Duration`].
    pub fn cache_op_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_op_timeout_ms)
    }

    /// Convenience wrapper used by constructors taking `Arc<Settings>`.
    pub fn into_shared(self) -> Arc<Settings> {
        Arc::new(self)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, CoreError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| CoreError::Input(format!("{} is not a valid value: {:?}", name, raw))),
        _ => Ok(default),
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
