//! Deliberation pipelines: council, arena, and targeted retry.
//!
//! Each pipeline is an async function that drives the staged orchestration,
//! publishes [`StreamEvent`]s through an [`EventSink`], persists partial
//! progress into the pending tracker, and appends the finished turn to the
//! conversation store. Errors never cross the event channel as anything but
//! a single `error` event; the pending marker keeps the partial data so the
//! turn can be resumed or retried.

pub mod arena;
pub mod council;
pub mod retry;

use crate::attachments::AttachmentStore;
use crate::config::{Settings, TITLE_MODEL};
use crate::deliberation::Synthesis;
use crate::error::{CouncilError, Result};
use crate::events::{EventSink, StreamEvent, WebSearchData};
use crate::gateway::{
    query_model, BackoffConfig, ChatMessage, ChatRequest, Gateway, TITLE_CALL_TIMEOUT,
};
use crate::pending::PendingTracker;
use crate::prompts;
use crate::storage::ConversationStore;
use crate::websearch::WebSearch;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Context carried over from an earlier conversation.
///
/// `source_conversation_id` is a weak reference: a lookup hint for the UI,
/// never an ownership edge; the referenced conversation is never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct PriorContext {
    pub original_question: String,
    pub synthesis: String,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
}

/// Per-request context threaded through pipelines and gateway calls.
///
/// Nothing here is ambient process state: the correlation id is generated at
/// the HTTP layer, logged as a structured field, and echoed to the client.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    /// User scope (directory) for storage, or anonymous.
    pub user: Option<String>,
}

impl RequestContext {
    pub fn new(user: Option<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            user,
        }
    }

    pub fn user_scope(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

/// Shared collaborators handed to every pipeline run.
#[derive(Clone)]
pub struct PipelineCtx {
    pub gateway: Arc<dyn Gateway>,
    pub backoff: BackoffConfig,
    pub settings: Settings,
    pub store: ConversationStore,
    pub pending: PendingTracker,
    pub attachments: AttachmentStore,
    pub search: WebSearch,
}

/// Run the synthesis call with one pipeline-level retry.
///
/// This retry is intentional and separate from the gateway's transport
/// retry: a chairman that failed terminally (after transport retries) gets
/// exactly one fresh chance. On repeat failure the synthesis is an
/// `"Error:"`-prefixed placeholder with empty metrics, persisted so the user
/// can invoke retry-synthesis later.
pub(crate) async fn synthesize_with_retry(
    ctx: &PipelineCtx,
    model: &str,
    prompt: String,
    fallback_message: &str,
) -> Synthesis {
    let request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);

    for attempt in 0..2 {
        match query_model(&ctx.gateway, &request, &ctx.backoff).await {
            Ok(reply) => {
                return Synthesis {
                    model: model.to_string(),
                    content: reply.content,
                    metrics: Some(reply.metrics),
                    reasoning_details: reply.reasoning_details,
                };
            }
            Err(e) => {
                tracing::warn!(
                    model,
                    attempt,
                    category = ?e.category,
                    error = %e,
                    "synthesis call failed"
                );
            }
        }
    }

    Synthesis {
        model: model.to_string(),
        content: fallback_message.to_string(),
        metrics: None,
        reasoning_details: None,
    }
}

/// Generate a short conversation title from the first user message.
///
/// Uses the fast title model with a 30 s budget; any failure falls back to
/// a generic title.
pub(crate) async fn generate_title(ctx: &PipelineCtx, query: &str) -> String {
    let request = ChatRequest::new(
        TITLE_MODEL,
        vec![ChatMessage::user(prompts::title_prompt(query))],
    )
    .with_timeout(TITLE_CALL_TIMEOUT);

    let reply = match query_model(&ctx.gateway, &request, &ctx.backoff).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "title generation failed");
            return "New Conversation".into();
        }
    };

    let mut title = reply.content.trim().trim_matches(['"', '\'']).to_string();
    if title.is_empty() {
        return "New Conversation".into();
    }
    if title.len() > 50 {
        let mut cut = 47;
        while !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
        title.push_str("...");
    }
    title
}

/// Optionally run the web search step, emitting its start/complete events.
pub(crate) async fn web_search_step(
    ctx: &PipelineCtx,
    sink: &EventSink,
    query: &str,
    enabled: bool,
) -> Result<(Option<String>, Option<String>)> {
    if !enabled {
        return Ok((None, None));
    }

    sink.emit(StreamEvent::WebSearchStart).await?;
    let (context, error) = ctx.search.search_formatted(query).await;
    sink.emit(StreamEvent::WebSearchComplete {
        data: WebSearchData {
            found: context.is_some(),
            error: error.clone(),
        },
    })
    .await?;
    Ok((context, error))
}

/// Route a pipeline failure to the stream and the pending marker.
///
/// Cancellation (client gone) is not an error: in-flight work stops and the
/// already-persisted partial data stays for a later resume. Everything else
/// is recorded under the marker's `error` key (without clearing it) and
/// surfaced as one `error` event.
pub(crate) async fn handle_pipeline_failure(
    ctx: &PipelineCtx,
    request: &RequestContext,
    conversation_id: &str,
    sink: &EventSink,
    error: CouncilError,
) {
    if matches!(error, CouncilError::Cancelled) {
        tracing::info!(
            conversation_id,
            correlation_id = %request.correlation_id,
            "client disconnected; partial data kept for resume"
        );
        return;
    }

    tracing::error!(
        conversation_id,
        correlation_id = %request.correlation_id,
        error = %error,
        "pipeline failed"
    );

    let _ = ctx.pending.update_progress(
        conversation_id,
        crate::pending::PartialData::error(error.to_string()),
        request.user_scope(),
    );
    sink.emit_best_effort(StreamEvent::Error {
        message: error.to_string(),
    })
    .await;
}
