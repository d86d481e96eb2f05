//! LLM service layer: provider profiles and the chat-completion client.

pub mod client;
pub mod models;

pub use client::{ChatCompletion, LlmClient};
pub use models::{ChatOptions, LlmError, ProviderKind, ProviderProfile};
