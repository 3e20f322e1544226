//! Request handlers for the HTTP API.

use super::stream::sse_response;
use super::AppState;
use crate::attachments::AttachmentMeta;
use crate::auth::client_ip;
use crate::config::{
    clamp_arena_rounds, DEFAULT_ARENA_ROUNDS, MAX_ARENA_ROUNDS, MIN_ARENA_ROUNDS,
};
use crate::deliberation::DeliberationMode;
use crate::error::CouncilError;
use crate::events::EventSink;
use crate::pipeline::{arena, council, retry, PriorContext, RequestContext};
use crate::storage::Conversation;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use uuid::Uuid;

/// Capacity of the pipeline → SSE event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Error envelope for non-stream routes.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<CouncilError> for ApiError {
    fn from(error: CouncilError) -> Self {
        let status = match &error {
            CouncilError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            CouncilError::Precondition(_) | CouncilError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.message}))).into_response()
    }
}

/// Build the per-request context: trusted-proxy identity + correlation id.
fn request_context(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> RequestContext {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok());
    let peer = client_ip(forwarded, addr.ip());

    let user = state
        .proxies
        .identify(peer, |name| headers.get(name).and_then(|v| v.to_str().ok()))
        .map(|u| u.username);

    RequestContext::new(user)
}

/// The panel bound to a conversation, falling back to global defaults.
fn effective_panel(state: &AppState, conversation: &Conversation) -> (Vec<String>, String) {
    let council = conversation
        .council_models
        .clone()
        .unwrap_or_else(|| state.ctx.settings.council_models());
    let chairman = conversation
        .chairman_model
        .clone()
        .unwrap_or_else(|| state.ctx.settings.chairman_model());
    (council, chairman)
}

// --- Request bodies ---

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub council_models: Option<Vec<String>>,
    #[serde(default)]
    pub chairman_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArenaConfig {
    pub round_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub mode: DeliberationMode,
    #[serde(default)]
    pub use_web_search: bool,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub arena_config: Option<ArenaConfig>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default)]
    pub prior_context: Option<PriorContext>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePanelRequest {
    pub council_models: Vec<String>,
    pub chairman_model: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub chairman_model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: Option<crate::pending::PendingMarker>,
    pub stale: bool,
}

// --- Handlers ---

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": "LLM Council API"}))
}

pub async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "web_search_available": state.ctx.search.is_available(),
        "council_models": state.ctx.settings.council_models(),
        "chairman_model": state.ctx.settings.chairman_model(),
        "auth_enabled": state.ctx.settings.auth_enabled,
        "arena": {
            "default_rounds": DEFAULT_ARENA_ROUNDS,
            "min_rounds": MIN_ARENA_ROUNDS,
            "max_rounds": MAX_ARENA_ROUNDS,
        },
    }))
}

pub async fn update_config(
    State(state): State<AppState>,
    Json(req): Json<UpdatePanelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.council_models.len() < 2 {
        return Err(CouncilError::Precondition(
            "At least 2 council models are required".into(),
        )
        .into());
    }

    state
        .ctx
        .settings
        .update_panel(Some(req.council_models), Some(req.chairman_model))?;
    Ok(Json(json!({
        "status": "ok",
        "council_models": state.ctx.settings.council_models(),
        "chairman_model": state.ctx.settings.chairman_model(),
    })))
}

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state.catalog.models().await;
    Json(json!({ "models": models }))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let request = request_context(&state, &headers, addr);

    let council = req
        .council_models
        .unwrap_or_else(|| state.ctx.settings.council_models());
    let chairman = req
        .chairman_model
        .unwrap_or_else(|| state.ctx.settings.chairman_model());

    let id = Uuid::new_v4().to_string();
    let conversation = state
        .ctx
        .store
        .create(&id, request.user_scope(), council, chairman)?;
    Ok(Json(conversation))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::storage::ConversationMeta>>, ApiError> {
    let request = request_context(&state, &headers, addr);
    Ok(Json(state.ctx.store.list(request.user_scope())?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Conversation>, ApiError> {
    let request = request_context(&state, &headers, addr);
    let conversation = state
        .ctx
        .store
        .get(&id, request.user_scope())?
        .ok_or(CouncilError::ConversationNotFound(id))?;
    Ok(Json(conversation.migrated()))
}

pub async fn update_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<UpdateTitleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = request_context(&state, &headers, addr);
    state
        .ctx
        .store
        .update_title(&id, &req.title, request.user_scope())?;
    Ok(Json(json!({"status": "ok", "title": req.title})))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = request_context(&state, &headers, addr);
    if !state.ctx.store.delete(&id, request.user_scope())? {
        return Err(CouncilError::ConversationNotFound(id).into());
    }
    Ok(Json(json!({"status": "deleted"})))
}

pub async fn get_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<PendingResponse>, ApiError> {
    let request = request_context(&state, &headers, addr);
    let pending = state.ctx.pending.get(&id, request.user_scope());
    let stale = pending.as_ref().map(|m| m.is_stale()).unwrap_or(false);
    Ok(Json(PendingResponse { pending, stale }))
}

pub async fn clear_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = request_context(&state, &headers, addr);
    let user = request.user_scope();
    state.ctx.pending.clear(&id, user)?;
    // The optimistic user append for the abandoned turn goes with it.
    let removed_message = state.ctx.store.remove_last_user_message(&id, user)?;
    Ok(Json(json!({"status": "cleared", "removed_user_message": removed_message})))
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<AttachmentMeta>, ApiError> {
    let request = request_context(&state, &headers, addr);
    let meta = state
        .ctx
        .attachments
        .save(&params.filename, &body, request.user_scope())?;
    Ok(Json(meta))
}

pub async fn send_message_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let request = request_context(&state, &headers, addr);
    let user = request.user_scope();

    let conversation = state
        .ctx
        .store
        .get(&id, user)?
        .ok_or_else(|| CouncilError::ConversationNotFound(id.clone()))?;

    // Overlapping turns on one conversation are rejected here; the pending
    // tracker itself does not serialize writers.
    if !req.resume {
        if let Some(marker) = state.ctx.pending.get(&id, user) {
            if !marker.is_stale() {
                return Err(ApiError::conflict(
                    "A deliberation is already in progress for this conversation",
                ));
            }
        }
    }

    let (council_models, chairman_model) = effective_panel(&state, &conversation);
    let is_first_message = conversation.messages.is_empty();

    let (sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let ctx = state.ctx.clone();
    let pipeline_request = request.clone();

    match req.mode {
        DeliberationMode::Council => {
            let input = council::CouncilInput {
                conversation_id: id,
                content: req.content,
                council_models,
                chairman_model,
                is_first_message,
                use_web_search: req.use_web_search,
                resume: req.resume,
                attachments: req.attachments,
                prior_context: req.prior_context,
            };
            tokio::spawn(async move {
                council::run(&ctx, &pipeline_request, input, &sink).await;
            });
        }
        DeliberationMode::Arena => {
            let round_count = clamp_arena_rounds(
                req.arena_config
                    .map(|c| c.round_count)
                    .unwrap_or(DEFAULT_ARENA_ROUNDS),
            );
            let input = arena::ArenaInput {
                conversation_id: id,
                content: req.content,
                round_count,
                council_models,
                chairman_model,
                is_first_message,
                use_web_search: req.use_web_search,
                attachments: req.attachments,
                prior_context: req.prior_context,
            };
            tokio::spawn(async move {
                arena::run(&ctx, &pipeline_request, input, &sink).await;
            });
        }
    }

    Ok(sse_response(&state.shutdown, &request.correlation_id, rx))
}

pub async fn extend_debate_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<RetryRequest>,
) -> Result<Response, ApiError> {
    let request = request_context(&state, &headers, addr);
    let user = request.user_scope();

    let conversation = state
        .ctx
        .store
        .get(&id, user)?
        .ok_or_else(|| CouncilError::ConversationNotFound(id.clone()))?;

    let (_, default_chairman) = effective_panel(&state, &conversation);
    let chairman_model = req.chairman_model.unwrap_or(default_chairman);

    let (sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let ctx = state.ctx.clone();
    let pipeline_request = request.clone();
    let input = arena::ExtendInput {
        conversation_id: id,
        chairman_model,
    };
    tokio::spawn(async move {
        arena::extend(&ctx, &pipeline_request, input, &sink).await;
    });

    Ok(sse_response(&state.shutdown, &request.correlation_id, rx))
}

pub async fn retry_synthesis_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<RetryRequest>,
) -> Result<Response, ApiError> {
    let request = request_context(&state, &headers, addr);
    let user = request.user_scope();

    let conversation = state
        .ctx
        .store
        .get(&id, user)?
        .ok_or_else(|| CouncilError::ConversationNotFound(id.clone()))?;

    let (_, default_chairman) = effective_panel(&state, &conversation);
    let chairman_model = req.chairman_model.unwrap_or(default_chairman);

    let (sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let ctx = state.ctx.clone();
    let pipeline_request = request.clone();
    let input = retry::RetryInput {
        conversation_id: id,
        chairman_model,
    };
    tokio::spawn(async move {
        retry::run(&ctx, &pipeline_request, input, &sink).await;
    });

    Ok(sse_response(&state.shutdown, &request.correlation_id, rx))
}
