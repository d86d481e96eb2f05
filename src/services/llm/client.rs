//! LLM Client - HTTP client for OpenAI-compatible chat APIs
//!
//! Uses reqwest to call chat-completion endpoints. Compatible with:
//! - OpenRouter
//! - DeepSeek
//! - Other OpenAI-compatible APIs
//!
//! Retry policy: non-2xx responses are retried with jitter-bounded
//! backoff, then routed to the fallback model when one is configured.
//! Timeouts and transport errors abort immediately.

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::{ChatOptions, LlmError, ProviderKind, ProviderProfile};

/// Seam between the analyzers and the concrete HTTP client, so analysis
/// logic is testable with a scripted model.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Single-shot chat request; returns the assistant message text
    async fn chat(&self, prompt: &str, opts: &ChatOptions) -> Result<String, LlmError>;

    /// Provider model identifier for result attribution
    fn model_name(&self) -> String;
}

/// LLM HTTP Client
pub struct LlmClient {
    http_client: Client,
    profile: ProviderProfile,
    /// Total HTTP attempts before the fallback model is consulted
    retry_count: u32,
    /// Timeout for the one fallback-model attempt
    fallback_timeout: Duration,
}

impl LlmClient {
    pub fn new(
        profile: ProviderProfile,
        retry_count: u32,
        fallback_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| LlmError::ApiError(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            "LLM client initialized: provider={} model={}",
            profile.kind.as_str(),
            profile.model
        );

        Ok(Self { http_client, profile, retry_count: retry_count.max(1), fallback_timeout })
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// One HTTP round-trip against a specific model
    async fn request_once(
        &self,
        prompt: &str,
        model: &str,
        opts: &ChatOptions,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &opts.system_prompt {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        messages.push(ChatMessage { role: "user".to_string(), content: prompt.to_string() });

        let chat_request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            max_tokens: Some(opts.max_tokens.unwrap_or(self.profile.max_tokens)),
            temperature: Some(opts.temperature.unwrap_or(self.profile.temperature)),
        };

        let url = format!("{}/chat/completions", self.profile.base_url);

        tracing::debug!("Calling LLM API: {} with model {}", url, model);

        let mut request = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.profile.api_key))
            .header("Content-Type", "application/json")
            .timeout(opts.timeout);

        // OpenRouter asks callers to identify themselves
        if self.profile.kind == ProviderKind::OpenRouter {
            request = request
                .header("HTTP-Referer", "https://github.com/finsight")
                .header("X-Title", "finsight");
        }

        let response = request.json(&chat_request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(opts.timeout.as_secs())
            } else {
                LlmError::ApiError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::HttpStatus { status: status.as_u16(), body });
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        if let Some(usage) = &chat_response.usage {
            tracing::debug!(
                "LLM usage: prompt={} completion={}",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| LlmError::ParseError("Empty response from LLM".to_string()))?;

        Ok(content.clone())
    }

    /// Jitter-bounded backoff after failed attempt `attempt` (1-based):
    /// 1–30 s, then 30–60 s, then 60–90 s.
    fn backoff_for_attempt(attempt: u32) -> Duration {
        let lower = if attempt <= 1 { 1 } else { 30 * (attempt as u64 - 1) };
        let upper = 30 * attempt as u64;
        let secs = rand::thread_rng().gen_range(lower..=upper);
        Duration::from_secs(secs)
    }
}

#[async_trait]
impl ChatCompletion for LlmClient {
    async fn chat(&self, prompt: &str, opts: &ChatOptions) -> Result<String, LlmError> {
        let model = opts.model.as_deref().unwrap_or(&self.profile.model);

        let mut last_error = None;
        for attempt in 1..=self.retry_count {
            match self.request_once(prompt, model, opts).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() => {
                    let backoff = Self::backoff_for_attempt(attempt);
                    tracing::warn!(
                        "LLM attempt {}/{} failed ({}), backing off {:?}",
                        attempt,
                        self.retry_count,
                        e,
                        backoff
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                },
                // Timeouts and transport errors abort without retry
                Err(e) => return Err(e),
            }
        }

        if let Some(fallback_model) = &self.profile.fallback_model {
            tracing::warn!("Primary model exhausted retries, trying fallback {}", fallback_model);
            let fallback_opts = ChatOptions {
                model: Some(fallback_model.clone()),
                timeout: self.fallback_timeout,
                ..opts.clone()
            };
            return self.request_once(prompt, fallback_model, &fallback_opts).await;
        }

        Err(last_error.unwrap_or_else(|| LlmError::ApiError("retries exhausted".to_string())))
    }

    fn model_name(&self) -> String {
        self.profile.model.clone()
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i32,
    completion_tokens: i32,
}
