//! Gateway client for the upstream LLM API.
//!
//! The [`Gateway`] trait abstracts the shared OpenAI-compatible gateway.
//! A call either yields a [`ModelReply`] (content, optional reasoning trace,
//! per-call metrics) or a [`ModelError`] carrying the upstream status and a
//! closed [`ErrorCategory`]. A `ModelError` is a *value*, not a crate error:
//! fan-out result maps hold one per failed model and callers distinguish the
//! two by tag, never by sentinel content.
//!
//! ## Architecture
//!
//! ```text
//! pipeline ──► query_model() ──► Gateway::complete() ──► gateway HTTP API
//!                  │                      │
//!            retry + backoff        OpenRouterGateway
//!            (transient only)       MockGateway (tests)
//! ```

pub mod backoff;
pub mod mock;
pub mod openrouter;
pub mod sse;

pub use backoff::BackoffConfig;
pub use mock::MockGateway;
pub use openrouter::OpenRouterGateway;

use crate::deliberation::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for the lightweight title-generation call.
pub const TITLE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// A normalized chat request against one model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Gateway model identifier (e.g. `"openai/gpt-5.1"`).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Per-call timeout override. `None` uses the client default.
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.into(), messages, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful model reply.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    /// Opaque reasoning trace, present for reasoning-capable models.
    pub reasoning_details: Option<Value>,
    pub metrics: Metrics,
}

/// Closed classification of a terminal model-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 402: out of credit.
    Billing,
    /// 401: bad or missing gateway key.
    Auth,
    /// 429.
    RateLimit,
    /// 408, 502, 503.
    Transient,
    /// Client-side timeout; no upstream status was observed.
    Timeout,
    /// Everything else.
    Unknown,
}

/// Terminal failure of one model call.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("model {model} failed ({category:?}): {message}")]
pub struct ModelError {
    /// The model the request was addressed to.
    pub model: String,
    /// Upstream HTTP status, absent for transport-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub category: ErrorCategory,
    pub message: String,
}

impl ModelError {
    /// Classify an upstream HTTP status.
    pub fn from_status(model: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let category = match status {
            402 => ErrorCategory::Billing,
            401 => ErrorCategory::Auth,
            429 => ErrorCategory::RateLimit,
            408 | 502 | 503 => ErrorCategory::Transient,
            _ => ErrorCategory::Unknown,
        };
        Self {
            model: model.into(),
            status: Some(status),
            category,
            message: message.into(),
        }
    }

    /// A client-side timeout (no upstream status).
    pub fn timeout(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            status: None,
            category: ErrorCategory::Timeout,
            message: message.into(),
        }
    }

    /// An unclassifiable transport or protocol failure.
    pub fn unknown(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            status: None,
            category: ErrorCategory::Unknown,
            message: message.into(),
        }
    }

    /// Whether the retry loop may replay this call.
    ///
    /// Transient statuses always retry. Timeouts retry only for streaming
    /// calls: a non-streaming request that timed out may have partially
    /// succeeded upstream, so replaying it risks double work.
    pub fn is_retryable(&self, streaming: bool) -> bool {
        match self.category {
            ErrorCategory::RateLimit | ErrorCategory::Transient => true,
            ErrorCategory::Timeout => streaming,
            _ => false,
        }
    }
}

/// Extract a human message from the gateway's error envelope
/// `{"error":{"code":int,"message":string}}`, falling back to `HTTP <status>`.
pub fn extract_error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {}", status))
}

/// Abstraction over the upstream LLM gateway.
///
/// Object-safe; shared as `Arc<dyn Gateway>` across pipelines.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Execute a non-streaming chat call.
    async fn complete(&self, request: &ChatRequest) -> Result<ModelReply, ModelError>;

    /// Execute a streaming chat call, invoking `on_token` per delta.
    ///
    /// The accumulated text is returned as the reply content; the final
    /// `usage` block (possibly in the terminator chunk) populates metrics.
    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<ModelReply, ModelError>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Call a model with transport-level retry.
///
/// Retries transient failures (per [`ModelError::is_retryable`]) up to
/// `config.max_retries` times with exponential backoff; returns the first
/// success or the last error.
pub async fn query_model(
    gateway: &Arc<dyn Gateway>,
    request: &ChatRequest,
    config: &BackoffConfig,
) -> Result<ModelReply, ModelError> {
    let mut last_error: Option<ModelError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt - 1);
            tracing::debug!(
                model = %request.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying model call"
            );
            tokio::time::sleep(delay).await;
        }

        match gateway.complete(request).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                if attempt < config.max_retries && e.is_retryable(false) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ModelError::unknown(&request.model, "retry loop exited unexpectedly")))
}

/// Streaming variant of [`query_model`].
///
/// Each retry replays the full request from scratch; deltas received on a
/// failed attempt are discarded from the accumulated reply.
pub async fn query_model_streaming(
    gateway: &Arc<dyn Gateway>,
    request: &ChatRequest,
    config: &BackoffConfig,
    on_token: &mut (dyn FnMut(String) + Send),
) -> Result<ModelReply, ModelError> {
    let mut last_error: Option<ModelError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt - 1);
            tracing::debug!(
                model = %request.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying streaming model call"
            );
            tokio::time::sleep(delay).await;
        }

        match gateway.complete_streaming(request, on_token).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                if attempt < config.max_retries && e.is_retryable(true) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ModelError::unknown(&request.model, "retry loop exited unexpectedly")))
}
