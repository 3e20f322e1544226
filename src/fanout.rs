//! Progressive parallel fan-out across a set of models.
//!
//! One worker task per model issues the gateway call (with transport retry)
//! and reports back over a shared channel; [`Fanout::next_event`] surfaces
//! completions, progress snapshots, and streamed tokens in upstream arrival
//! order (not input order) so pipelines can forward partial results while
//! slower panel members are still thinking.
//!
//! A failure in one model's call never affects the others: the result map
//! holds a [`ModelError`] for the failed entry and a reply for the rest.

use crate::error::{CouncilError, Result};
use crate::events::ProgressData;
use crate::gateway::{
    query_model, query_model_streaming, BackoffConfig, ChatMessage, ChatRequest, Gateway,
    ModelError, ModelReply,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Prompt input for a fan-out: one shared prompt, or one per model.
#[derive(Debug, Clone)]
pub enum FanoutPrompt {
    Shared(Vec<ChatMessage>),
    PerModel(HashMap<String, Vec<ChatMessage>>),
}

impl FanoutPrompt {
    fn messages_for(&self, model: &str) -> Option<Vec<ChatMessage>> {
        match self {
            FanoutPrompt::Shared(messages) => Some(messages.clone()),
            FanoutPrompt::PerModel(map) => map.get(model).cloned(),
        }
    }
}

/// Options controlling a fan-out run.
#[derive(Debug, Clone, Default)]
pub struct FanoutOptions {
    /// Route calls through the streaming gateway endpoint and surface
    /// [`FanoutEvent::Token`]s.
    pub stream_tokens: bool,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
}

/// An observation surfaced while the fan-out is running.
#[derive(Debug)]
pub enum FanoutEvent {
    /// One model's call terminated. Fired in upstream completion order.
    Completed {
        model: String,
        outcome: std::result::Result<ModelReply, ModelError>,
    },
    /// Progress snapshot, fired after each completion.
    Progress(ProgressData),
    /// A streamed token (only when `stream_tokens` is set).
    Token { model: String, token: String },
}

enum WorkerMsg {
    Token {
        model: String,
        token: String,
    },
    Done {
        model: String,
        outcome: std::result::Result<ModelReply, ModelError>,
    },
}

/// Final outcome of a fan-out: every input model maps to a terminated call.
pub type FanoutResults = HashMap<String, std::result::Result<ModelReply, ModelError>>;

/// A running fan-out. Dropping it aborts all in-flight workers.
pub struct Fanout {
    rx: mpsc::UnboundedReceiver<WorkerMsg>,
    handles: Vec<JoinHandle<()>>,
    queue: VecDeque<FanoutEvent>,
    results: FanoutResults,
    completed_models: Vec<String>,
    all_models: Vec<String>,
    remaining: usize,
}

impl Fanout {
    /// Spawn one worker per model.
    ///
    /// Preconditions checked before any outbound call: the model list must be
    /// non-empty, and a per-model prompt map must cover every model.
    pub fn spawn(
        gateway: Arc<dyn Gateway>,
        backoff: BackoffConfig,
        models: &[String],
        prompt: FanoutPrompt,
        options: FanoutOptions,
    ) -> Result<Self> {
        if models.is_empty() {
            return Err(CouncilError::Precondition(
                "fan-out requires at least one model".into(),
            ));
        }
        for model in models {
            if prompt.messages_for(model).is_none() {
                return Err(CouncilError::Precondition(format!(
                    "no prompt provided for model {}",
                    model
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(models.len());

        for model in models {
            let messages = prompt
                .messages_for(model)
                .expect("prompt presence checked above");
            let mut request = ChatRequest::new(model.clone(), messages);
            if let Some(timeout) = options.timeout {
                request = request.with_timeout(timeout);
            }

            let gateway = gateway.clone();
            let backoff = backoff.clone();
            let tx = tx.clone();
            let model = model.clone();
            let stream_tokens = options.stream_tokens;

            handles.push(tokio::spawn(async move {
                let outcome = if stream_tokens {
                    let token_tx = tx.clone();
                    let token_model = model.clone();
                    let mut on_token = move |token: String| {
                        let _ = token_tx.send(WorkerMsg::Token {
                            model: token_model.clone(),
                            token,
                        });
                    };
                    query_model_streaming(&gateway, &request, &backoff, &mut on_token).await
                } else {
                    query_model(&gateway, &request, &backoff).await
                };
                let _ = tx.send(WorkerMsg::Done { model, outcome });
            }));
        }

        Ok(Self {
            rx,
            handles,
            queue: VecDeque::new(),
            results: HashMap::new(),
            completed_models: Vec::new(),
            all_models: models.to_vec(),
            remaining: models.len(),
        })
    }

    /// The next observation, or `None` once every call has terminated.
    ///
    /// Each event is fully delivered before the next is produced, so a
    /// caller's handling runs to completion between completions.
    pub async fn next_event(&mut self) -> Option<FanoutEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.remaining == 0 {
                return None;
            }

            match self.rx.recv().await {
                Some(WorkerMsg::Token { model, token }) => {
                    return Some(FanoutEvent::Token { model, token });
                }
                Some(WorkerMsg::Done { model, outcome }) => {
                    self.remaining -= 1;
                    self.completed_models.push(model.clone());

                    let pending_models: Vec<String> = self
                        .all_models
                        .iter()
                        .filter(|m| !self.completed_models.contains(m))
                        .cloned()
                        .collect();

                    self.queue.push_back(FanoutEvent::Progress(ProgressData {
                        completed: self.completed_models.len(),
                        total: self.all_models.len(),
                        completed_models: self.completed_models.clone(),
                        pending_models,
                    }));

                    self.results.insert(model.clone(), clone_outcome(&outcome));
                    return Some(FanoutEvent::Completed { model, outcome });
                }
                None => return None,
            }
        }
    }

    /// Drain remaining events (discarding them) and return the result map.
    pub async fn finish(mut self) -> FanoutResults {
        while self.next_event().await.is_some() {}
        std::mem::take(&mut self.results)
    }

    /// The result map collected so far.
    pub fn results(&self) -> &FanoutResults {
        &self.results
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn clone_outcome(
    outcome: &std::result::Result<ModelReply, ModelError>,
) -> std::result::Result<ModelReply, ModelError> {
    match outcome {
        Ok(reply) => Ok(reply.clone()),
        Err(err) => Err(err.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, MockOutcome};
    use async_trait::async_trait;

    /// Gateway double that delays per model, to make arrival order testable.
    struct DelayedGateway {
        inner: MockGateway,
        delays_ms: HashMap<String, u64>,
    }

    #[async_trait]
    impl Gateway for DelayedGateway {
        async fn complete(
            &self,
            request: &ChatRequest,
        ) -> std::result::Result<ModelReply, ModelError> {
            if let Some(ms) = self.delays_ms.get(&request.model) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            self.inner.complete(request).await
        }

        async fn complete_streaming(
            &self,
            request: &ChatRequest,
            on_token: &mut (dyn FnMut(String) + Send),
        ) -> std::result::Result<ModelReply, ModelError> {
            if let Some(ms) = self.delays_ms.get(&request.model) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            self.inner.complete_streaming(request, on_token).await
        }

        fn name(&self) -> &'static str {
            "delayed-mock"
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn shared_prompt() -> FanoutPrompt {
        FanoutPrompt::Shared(vec![ChatMessage::user("question")])
    }

    #[tokio::test]
    async fn test_events_follow_completion_order() {
        let inner = MockGateway::default();
        inner.push_for_model("slow/model", MockOutcome::reply("slow answer"));
        inner.push_for_model("fast/model", MockOutcome::reply("fast answer"));
        let gateway: Arc<dyn Gateway> = Arc::new(DelayedGateway {
            inner,
            delays_ms: [("slow/model".to_string(), 80), ("fast/model".to_string(), 5)].into(),
        });

        let mut fanout = Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &models(&["slow/model", "fast/model"]),
            shared_prompt(),
            FanoutOptions::default(),
        )
        .unwrap();

        let mut completions = Vec::new();
        let mut progress_counts = Vec::new();
        while let Some(event) = fanout.next_event().await {
            match event {
                FanoutEvent::Completed { model, .. } => completions.push(model),
                FanoutEvent::Progress(p) => progress_counts.push(p.completed),
                FanoutEvent::Token { .. } => {}
            }
        }

        assert_eq!(completions, vec!["fast/model", "slow/model"]);
        assert_eq!(progress_counts, vec![1, 2]);
        let results = fanout.finish().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["fast/model"].as_ref().unwrap().content, "fast answer");
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mock = MockGateway::default();
        mock.push_for_model("good/model", MockOutcome::reply("fine"));
        mock.push_for_model("bad/model", MockOutcome::status(400, "rejected"));
        let gateway: Arc<dyn Gateway> = Arc::new(mock);

        let fanout = Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &models(&["good/model", "bad/model"]),
            shared_prompt(),
            FanoutOptions::default(),
        )
        .unwrap();

        let results = fanout.finish().await;
        assert!(results["good/model"].is_ok());
        let err = results["bad/model"].as_ref().unwrap_err();
        assert_eq!(err.status, Some(400));
    }

    #[tokio::test]
    async fn test_empty_model_list_rejected_before_any_call() {
        let gateway: Arc<dyn Gateway> = Arc::new(MockGateway::fixed("x"));
        let err = Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &[],
            shared_prompt(),
            FanoutOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CouncilError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_missing_per_model_prompt_rejected() {
        let gateway: Arc<dyn Gateway> = Arc::new(MockGateway::fixed("x"));
        let prompt = FanoutPrompt::PerModel(
            [("a/model".to_string(), vec![ChatMessage::user("q")])].into(),
        );
        let err = Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &models(&["a/model", "b/model"]),
            prompt,
            FanoutOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CouncilError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_tokens_forwarded_when_streaming() {
        let gateway: Arc<dyn Gateway> = Arc::new(MockGateway::fixed("streamed text"));
        let mut fanout = Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &models(&["m/one"]),
            shared_prompt(),
            FanoutOptions { stream_tokens: true, timeout: None },
        )
        .unwrap();

        let mut tokens = Vec::new();
        while let Some(event) = fanout.next_event().await {
            if let FanoutEvent::Token { token, .. } = event {
                tokens.push(token);
            }
        }
        assert_eq!(tokens, vec!["streamed text"]);
    }

    #[tokio::test]
    async fn test_per_model_prompts_reach_their_model() {
        let mock = MockGateway::fixed("ok");
        let gateway: Arc<dyn Gateway> = Arc::new(mock.clone());
        let prompt = FanoutPrompt::PerModel(
            [
                ("a/model".to_string(), vec![ChatMessage::user("prompt for a")]),
                ("b/model".to_string(), vec![ChatMessage::user("prompt for b")]),
            ]
            .into(),
        );

        Fanout::spawn(
            gateway,
            BackoffConfig::immediate(),
            &models(&["a/model", "b/model"]),
            prompt,
            FanoutOptions::default(),
        )
        .unwrap()
        .finish()
        .await;

        let prompts = mock.seen_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts.iter().any(|p| p.contains("prompt for a")));
        assert!(prompts.iter().any(|p| p.contains("prompt for b")));
    }
}
