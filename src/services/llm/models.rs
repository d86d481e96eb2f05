//! LLM Data Models
//!
//! Provider profiles, chat options, and error types for the LLM client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ProviderConfig;

// ============================================================================
// Provider profiles
// ============================================================================

/// Supported chat-completion provider profiles. Profiles differ only in
/// base URL, default model, and extra request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenRouter,
    DeepSeek,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
        }
    }

    pub fn parse_kind(s: &str) -> Self {
        match s {
            "openrouter" => Self::OpenRouter,
            _ => Self::DeepSeek,
        }
    }
}

/// Resolved provider profile used by the client
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl ProviderProfile {
    /// Build from the config section. A missing API key is a fatal
    /// construction error, not a per-call error.
    pub fn from_config(kind: ProviderKind, config: &ProviderConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() || config.api_key.starts_with("${") {
            return Err(LlmError::MissingApiKey(kind.as_str()));
        }
        Ok(Self {
            kind,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            fallback_model: if config.fallback_model.is_empty() {
                None
            } else {
                Some(config.fallback_model.clone())
            },
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

// ============================================================================
// Chat options
// ============================================================================

/// Per-call options for a chat request
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Model override; the profile default when None
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: None,
            temperature: None,
            timeout: Duration::from_secs(600),
            system_prompt: None,
        }
    }
}

impl ChatOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout, ..Default::default() }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// LLM client errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key not configured for provider {0}")]
    MissingApiKey(&'static str),

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM HTTP error {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),
}

impl LlmError {
    /// Only non-2xx HTTP responses are retried; timeouts and transport
    /// errors abort immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HttpStatus { .. })
    }
}
