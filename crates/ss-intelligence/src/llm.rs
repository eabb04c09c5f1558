//! LLM provider abstraction layer.
//!
//! A unified async trait over LLM vendors, a production Anthropic
//! implementation, and a scriptable mock for tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The provider is down (5xx).
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

impl ss_harness::retry::Transient for LlmError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Http(_)
                | LlmError::RateLimited { .. }
                | LlmError::Timeout
                | LlmError::Unavailable(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }
}

/// Configuration for an LLM completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            system_prompt: None,
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// LLM provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    ///
    /// `api_key` is the Anthropic API key (x-api-key header).
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Anthropic Messages API.
    ///
    /// The system prompt goes in the top-level `system` field, not as a
    /// message; system messages in the array are folded into it.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let mut system_text: Option<String> = config.system_prompt.clone();

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    if let Some(ref mut s) = system_text {
                        s.push('\n');
                        s.push_str(&msg.content);
                    } else {
                        system_text = Some(msg.content.clone());
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });

        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }

        body
    }
}

/// Deserialize helpers for the Anthropic API response.
#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    _type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !resp.status().is_success() {
            // Consume the body for the error message before surfacing.
            let text = resp.text().await.unwrap_or_default();
            if status >= 500 {
                return Err(LlmError::Unavailable(format!("status {status}: {text}")));
            }
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock LLM provider for testing.
///
/// Returns pre-configured responses. Each call to `complete` pops the next
/// response from the queue. If the queue is empty, returns a default
/// response.
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    /// Captured request bodies for test assertions.
    #[allow(clippy::type_complexity)]
    captured_requests: Arc<Mutex<Vec<(Vec<LlmMessage>, LlmConfig)>>>,
    /// Simulated per-call latency.
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MockProvider {
    /// Create a mock provider with no pre-configured responses.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
            latency: Arc::new(Mutex::new(None)),
        }
    }

    /// Simulate provider latency on every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// Queue a successful response.
    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push_response(response);
        self
    }

    /// Queue a successful response (non-consuming form).
    pub fn push_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        self.push_error(error);
        self
    }

    /// Queue an error response (non-consuming form).
    pub fn push_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get captured requests for assertions.
    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        self.captured_requests.lock().unwrap().clone()
    }

    /// Build a response whose content is a plausible analysis payload.
    pub fn analysis_response(model: &str, investment: f64, growth: f64) -> LlmResponse {
        let body = serde_json::json!({
            "scores": {
                "investment": investment,
                "innovation": growth,
                "team": 60.0,
                "market": 65.0,
            },
            "recommendation": if investment >= 80.0 { "buy" } else { "hold" },
            "summary": "Mock analysis summary.",
            "strengths": ["active community"],
            "risks": ["single maintainer"],
            "questions": ["monetization?"],
        });
        LlmResponse {
            content: body.to_string(),
            model: model.to_string(),
            input_tokens: 800,
            output_tokens: 300,
            finish_reason: "end_turn".to_string(),
        }
    }

    fn default_response(model: &str) -> LlmResponse {
        Self::analysis_response(model, 70.0, 55.0)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.captured_requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), config.clone()));

        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            Ok(Self::default_response(&config.model))
        } else {
            queue.pop_front().unwrap()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ss_harness::retry::Transient;

    #[test]
    fn anthropic_body_hoists_system_messages() {
        let messages = vec![
            LlmMessage::system("You are an analyst."),
            LlmMessage::user("Analyze this repo."),
        ];
        let config = LlmConfig::default();
        let body = AnthropicProvider::build_request_body(&messages, &config);

        assert_eq!(body["system"], "You are an analyst.");
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
    }

    #[test]
    fn anthropic_body_merges_config_system_prompt() {
        let messages = vec![LlmMessage::system("Second."), LlmMessage::user("hi")];
        let config = LlmConfig {
            system_prompt: Some("First.".into()),
            ..LlmConfig::default()
        };
        let body = AnthropicProvider::build_request_body(&messages, &config);
        assert_eq!(body["system"], "First.\nSecond.");
    }

    #[test]
    fn llm_error_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Unavailable("503".into()).is_transient());
        assert!(LlmError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_transient());
        assert!(!LlmError::InvalidResponse("bad json".into()).is_transient());
        assert!(!LlmError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn rate_limited_surfaces_retry_after() {
        let err = LlmError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn mock_provider_pops_queue_then_defaults() {
        let provider = MockProvider::new()
            .with_error(LlmError::Timeout)
            .with_response(MockProvider::analysis_response("m", 85.0, 60.0));

        let messages = vec![LlmMessage::user("go")];
        let config = LlmConfig::default();

        assert!(provider.complete(&messages, &config).await.is_err());
        let ok = provider.complete(&messages, &config).await.unwrap();
        assert_eq!(ok.model, "m");
        // Queue empty: defaults from here on.
        assert!(provider.complete(&messages, &config).await.is_ok());
        assert_eq!(provider.captured_requests().len(), 3);
    }
}
