//! Mock gateway for testing without a live upstream.
//!
//! [`MockGateway`] plays back scripted outcomes (successes and
//! [`ModelError`]s alike) in order and counts upstream calls, so retry behavior and
//! failure isolation can be asserted deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChatRequest, Gateway, ModelError, ModelReply};
use crate::deliberation::Metrics;

/// One scripted call result.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply(ModelReply),
    Error(ModelError),
}

impl MockOutcome {
    /// A plain successful reply with default metrics.
    pub fn reply(content: impl Into<String>) -> Self {
        MockOutcome::Reply(ModelReply {
            content: content.into(),
            reasoning_details: None,
            metrics: Metrics::default(),
        })
    }

    /// A successful reply with explicit metrics.
    pub fn reply_with_metrics(content: impl Into<String>, metrics: Metrics) -> Self {
        MockOutcome::Reply(ModelReply {
            content: content.into(),
            reasoning_details: None,
            metrics,
        })
    }

    /// A failure classified from an upstream status. The model id is filled
    /// in from the request at call time.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        MockOutcome::Error(ModelError::from_status("", status, message))
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Global script consumed in call order, regardless of model.
    script: Vec<MockOutcome>,
    /// Per-model scripts, consumed before falling back to the global script.
    per_model: HashMap<String, Vec<MockOutcome>>,
    /// Prompts seen, in call order, for content assertions.
    requests: Vec<ChatRequest>,
}

/// A scripted gateway double. Cloning shares the script and counters.
#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
    calls: Arc<AtomicUsize>,
}

impl MockGateway {
    /// Every call succeeds with the same content.
    pub fn fixed(content: impl Into<String>) -> Self {
        let gateway = Self::default();
        gateway.push(MockOutcome::reply(content));
        gateway
    }

    /// Play back `outcomes` in call order; the last outcome repeats once the
    /// script is exhausted.
    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        assert!(!outcomes.is_empty(), "MockGateway requires at least one outcome");
        let gateway = Self::default();
        gateway.state.lock().unwrap().script = outcomes;
        gateway
    }

    /// Append an outcome to the global script.
    pub fn push(&self, outcome: MockOutcome) {
        self.state.lock().unwrap().script.push(outcome);
    }

    /// Queue an outcome for a specific model, taking precedence over the
    /// global script.
    pub fn push_for_model(&self, model: impl Into<String>, outcome: MockOutcome) {
        self.state
            .lock()
            .unwrap()
            .per_model
            .entry(model.into())
            .or_default()
            .push(outcome);
    }

    /// Total upstream calls made (including retried attempts).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The prompts of every request seen, flattened per call.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|r| {
                r.messages
                    .iter()
                    .map(|m| m.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect()
    }

    fn next_outcome(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        let outcome = if let Some(queue) = state.per_model.get_mut(&request.model) {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        } else {
            None
        };

        let outcome = outcome.unwrap_or_else(|| {
            if state.script.len() > 1 {
                state.script.remove(0)
            } else {
                state
                    .script
                    .first()
                    .cloned()
                    .unwrap_or_else(|| MockOutcome::reply(""))
            }
        });

        match outcome {
            MockOutcome::Reply(reply) => Ok(reply),
            MockOutcome::Error(mut err) => {
                if err.model.is_empty() {
                    err.model = request.model.clone();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        self.next_outcome(request)
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<ModelReply, ModelError> {
        let reply = self.next_outcome(request)?;
        on_token(reply.content.clone());
        Ok(reply)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Metrics helper for tests.
pub fn test_metrics(cost: f64, tokens: u64, latency_ms: u64) -> Metrics {
    Metrics {
        prompt_tokens: tokens / 2,
        completion_tokens: tokens - tokens / 2,
        total_tokens: tokens,
        cost,
        latency_ms,
        provider: Some("Mock".into()),
        request_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ChatMessage;

    fn request(model: &str) -> ChatRequest {
        ChatRequest::new(model, vec![ChatMessage::user("q")])
    }

    #[tokio::test]
    async fn test_fixed_repeats() {
        let mock = MockGateway::fixed("hello");
        let r1 = mock.complete(&request("a")).await.unwrap();
        let r2 = mock.complete(&request("b")).await.unwrap();
        assert_eq!(r1.content, "hello");
        assert_eq!(r2.content, "hello");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_order_and_repeat() {
        let mock = MockGateway::scripted(vec![
            MockOutcome::reply("first"),
            MockOutcome::reply("second"),
        ]);
        assert_eq!(mock.complete(&request("m")).await.unwrap().content, "first");
        assert_eq!(mock.complete(&request("m")).await.unwrap().content, "second");
        // Last outcome repeats.
        assert_eq!(mock.complete(&request("m")).await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_per_model_takes_precedence() {
        let mock = MockGateway::fixed("global");
        mock.push_for_model("special", MockOutcome::reply("scoped"));

        assert_eq!(mock.complete(&request("other")).await.unwrap().content, "global");
        assert_eq!(mock.complete(&request("special")).await.unwrap().content, "scoped");
        // Scoped queue drained; falls back to global.
        assert_eq!(mock.complete(&request("special")).await.unwrap().content, "global");
    }

    #[tokio::test]
    async fn test_error_fills_model_id() {
        let mock = MockGateway::scripted(vec![MockOutcome::status(429, "slow down")]);
        let err = mock.complete(&request("who/ami")).await.unwrap_err();
        assert_eq!(err.model, "who/ami");
        assert_eq!(err.status, Some(429));
    }

    #[tokio::test]
    async fn test_streaming_emits_single_token() {
        let mock = MockGateway::fixed("streamed");
        let mut tokens = Vec::new();
        let reply = mock
            .complete_streaming(&request("m"), &mut |t| tokens.push(t))
            .await
            .unwrap();
        assert_eq!(reply.content, "streamed");
        assert_eq!(tokens, vec!["streamed"]);
    }
}
