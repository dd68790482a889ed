//! Concrete LLM client implementations.

pub mod common;
pub mod mock;
pub mod openai;
