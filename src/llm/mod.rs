//! LLM provider layer.
//!
//! One request shape, three providers behind a single enum: `Gemini`,
//! `OpenAi`, and a deterministic `Mock` that satisfies the same contract.
//! Transient failures (429, 5xx, transport) are retried with exponential
//! backoff and jitter, at most three attempts; everything else fast-fails
//! so callers can take their degraded path.

pub mod gemini;
pub mod mock;
pub mod openai;

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::config::NoemaConfig;

pub use gemini::GeminiClient;
pub use mock::MockClient;
pub use openai::OpenAiClient;

/// Maximum attempts per logical call (1 initial + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Ask the provider for a JSON object response.
    pub json_output: bool,
}

impl LlmRequest {
    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
            max_output_tokens: 4096,
            json_output: true,
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.4,
            max_output_tokens: 1024,
            json_output: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("no API key configured for {0}")]
    MissingKey(&'static str),

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            LlmError::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Provider selection. Gemini wins when both keys are present, matching the
/// primary/fallback order of the recognised environment variables.
pub enum LlmClient {
    Gemini(GeminiClient),
    OpenAi(OpenAiClient),
    Mock(MockClient),
}

impl LlmClient {
    pub fn from_config(config: &NoemaConfig) -> Self {
        if let Some(key) = &config.gemini_api_key {
            return LlmClient::Gemini(GeminiClient::new(
                key.clone(),
                config.gemini_model.clone(),
                config.gemini_vision_model.clone(),
            ));
        }
        if let Some(key) = &config.openai_api_key {
            return LlmClient::OpenAi(OpenAiClient::new(key.clone()));
        }
        warn!("no LLM API key configured; using the deterministic mock provider");
        LlmClient::Mock(MockClient::new())
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            LlmClient::Gemini(_) => "gemini",
            LlmClient::OpenAi(_) => "openai",
            LlmClient::Mock(_) => "mock",
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, LlmClient::Mock(_))
    }

    /// One text/JSON generation with bounded retries for transient errors.
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            let result = match self {
                LlmClient::Gemini(client) => client.generate(request).await,
                LlmClient::OpenAi(client) => client.generate(request).await,
                LlmClient::Mock(client) => client.generate(request),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    warn!(attempt, error = %err, "retrying LLM call");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(LlmError::Timeout))
    }

    /// Describe a PNG screenshot. Same retry policy as `generate`.
    pub async fn describe_image(&self, png: &[u8], prompt: &str) -> Result<String, LlmError> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            let result = match self {
                LlmClient::Gemini(client) => client.describe_image(png, prompt).await,
                LlmClient::OpenAi(client) => client.describe_image(png, prompt).await,
                LlmClient::Mock(client) => client.describe_image(png, prompt),
            };
            match result {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    warn!(attempt, error = %err, "retrying vision call");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(LlmError::Timeout))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(4));
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Strip Markdown code fences that providers like to wrap JSON in.
pub fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```json") {
        return inner.trim_end_matches("```").trim();
    }
    if let Some(inner) = trimmed.strip_prefix("```") {
        return inner.trim_end_matches("```").trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(LlmError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(!LlmError::Http { status: 400, message: String::new() }.is_retryable());
        assert!(!LlmError::Timeout.is_retryable());
        assert!(LlmError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn json_block_extraction() {
        assert_eq!(extract_json_block("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_block("{\"a\":1}"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn mock_provider_is_selected_without_keys() {
        let client = LlmClient::from_config(&NoemaConfig::default());
        assert!(client.is_mock());
        let response = client.generate(&LlmRequest::json("{}")).await.unwrap();
        assert!(!response.text.is_empty());
    }

    #[tokio::test]
    async fn scripted_mock_errors_surface_after_retries() {
        let client = LlmClient::Mock(MockClient::failing(503));
        let err = client.generate(&LlmRequest::text("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 503, .. }));
        // all attempts consumed
        if let LlmClient::Mock(mock) = &client {
            assert_eq!(mock.calls(), MAX_ATTEMPTS as u64);
        }
    }
}
