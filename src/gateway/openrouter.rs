//! Gateway client for the OpenRouter-style chat-completions API.
//!
//! Speaks the OpenAI-compatible wire protocol: `POST {api_url}` with a
//! `{model, messages}` body, `Authorization: Bearer` auth, SSE streaming
//! with `data: {"choices":[{"delta":{"content":"…"}}]}` chunks.
//! Every call is timed and the upstream `usage` block is folded into
//! per-call [`Metrics`].

use super::sse::SseDecoder;
use super::{extract_error_message, ChatRequest, Gateway, ModelError, ModelReply};
use crate::deliberation::Metrics;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Build the process-wide pooled HTTP client.
///
/// One client is shared across all pipelines: up to 10 idle keep-alive
/// connections per host with a 90 s idle timeout, 30 s connect timeout,
/// 120 s default request timeout.
pub fn shared_client(default_timeout: Duration) -> Client {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .connect_timeout(Duration::from_secs(30))
        .timeout(default_timeout)
        .build()
        .expect("failed to build HTTP client")
}

/// Client for an OpenAI-compatible LLM gateway.
#[derive(Clone)]
pub struct OpenRouterGateway {
    client: Client,
    /// Full chat-completions endpoint URL.
    api_url: String,
    api_key: String,
}

impl std::fmt::Debug for OpenRouterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterGateway")
            .field("api_url", &self.api_url)
            .field("api_key", &"***")
            .finish()
    }
}

impl OpenRouterGateway {
    pub fn new(client: Client, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    fn build_body(request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn build_http_request(&self, request: &ChatRequest, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body);
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }
        req
    }

    fn transport_error(model: &str, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::timeout(model, format!("request timed out: {}", err))
        } else {
            ModelError::unknown(model, format!("request failed: {}", err))
        }
    }

    /// Fold an upstream `usage` block plus envelope fields into [`Metrics`].
    fn metrics_from_usage(data: &Value, latency_ms: u64) -> Metrics {
        let usage = data.get("usage").cloned().unwrap_or(Value::Null);
        let int = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);

        Metrics {
            prompt_tokens: int(&usage, "prompt_tokens"),
            completion_tokens: int(&usage, "completion_tokens"),
            total_tokens: int(&usage, "total_tokens"),
            cost: usage.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
            latency_ms,
            provider: data
                .get("provider")
                .and_then(Value::as_str)
                .map(String::from),
            request_id: data.get("id").and_then(Value::as_str).map(String::from),
        }
    }

    fn parse_completion(model: &str, data: &Value, latency_ms: u64) -> Result<ModelReply, ModelError> {
        let message = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ModelError::unknown(model, "response contained no choices"))?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let reasoning_details = message
            .get("reasoning_details")
            .filter(|v| !v.is_null())
            .cloned();

        Ok(ModelReply {
            content,
            reasoning_details,
            metrics: Self::metrics_from_usage(data, latency_ms),
        })
    }

    fn delta_content(chunk: &Value) -> Option<&str> {
        chunk
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
    }
}

#[async_trait]
impl Gateway for OpenRouterGateway {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        let body = Self::build_body(request, false);
        let start = Instant::now();

        let resp = self
            .build_http_request(request, &body)
            .send()
            .await
            .map_err(|e| Self::transport_error(&request.model, e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                &request.model,
                status,
                extract_error_message(status, &text),
            ));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| Self::transport_error(&request.model, e))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        Self::parse_completion(&request.model, &data, latency_ms)
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<ModelReply, ModelError> {
        let body = Self::build_body(request, true);
        let start = Instant::now();

        let resp = self
            .build_http_request(request, &body)
            .send()
            .await
            .map_err(|e| Self::transport_error(&request.model, e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            // The error body has not been read yet on streamed responses;
            // read it eagerly so the envelope can be classified.
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                &request.model,
                status,
                extract_error_message(status, &text),
            ));
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulated = String::new();
        let mut usage_chunk: Option<Value> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Self::transport_error(&request.model, e))?;
            for value in decoder.decode(&chunk) {
                if let Some(content) = Self::delta_content(&value) {
                    if !content.is_empty() {
                        accumulated.push_str(content);
                        on_token(content.to_string());
                    }
                }
                // Usage may arrive on any chunk, typically the terminator.
                if value.get("usage").map_or(false, |u| !u.is_null()) {
                    usage_chunk = Some(value);
                }
            }
        }

        for value in decoder.flush() {
            if let Some(content) = Self::delta_content(&value) {
                if !content.is_empty() {
                    accumulated.push_str(content);
                    on_token(content.to_string());
                }
            }
            if value.get("usage").map_or(false, |u| !u.is_null()) {
                usage_chunk = Some(value);
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let metrics = match &usage_chunk {
            Some(data) => Self::metrics_from_usage(data, latency_ms),
            None => Metrics {
                latency_ms,
                ..Metrics::default()
            },
        };

        Ok(ModelReply {
            content: accumulated,
            reasoning_details: None,
            metrics,
        })
    }

    fn name(&self) -> &'static str {
        "openrouter"
    }
}
