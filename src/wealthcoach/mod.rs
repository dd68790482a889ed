// src/wealthcoach/mod.rs

pub mod auth;
pub mod background;
pub mod cache;
pub mod chat_service;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod http_api;
pub mod prompt;
pub mod rate_limit;
pub mod retriever;
pub mod vector_store;
pub mod ws;

pub use chat_service::ChatService;
pub use config::Settings;
pub use error::CoreError;
