//! HTTP + SSE transport.
//!
//! Thin layer over the pipelines: routing, request decoding, trusted-proxy
//! identity, correlation-id propagation, and the channel → SSE bridge.
//! Precondition failures are 4xx on plain routes and a single `error` event
//! on stream routes; pipeline errors never escape as HTTP failures.

mod handlers;
mod stream;

pub use handlers::ApiError;

use crate::auth::TrustedProxies;
use crate::catalog::ModelCatalog;
use crate::pipeline::PipelineCtx;
use crate::shutdown::{ShutdownCoordinator, SHUTDOWN_GRACE};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state. Cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub ctx: PipelineCtx,
    pub catalog: Arc<ModelCatalog>,
    pub proxies: Arc<TrustedProxies>,
    pub shutdown: ShutdownCoordinator,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/config", get(handlers::get_config).post(handlers::update_config))
        .route("/api/models", get(handlers::list_models))
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(handlers::get_conversation)
                .patch(handlers::update_title)
                .delete(handlers::delete_conversation),
        )
        .route(
            "/api/conversations/{id}/message/stream",
            post(handlers::send_message_stream),
        )
        .route(
            "/api/conversations/{id}/extend-debate/stream",
            post(handlers::extend_debate_stream),
        )
        .route(
            "/api/conversations/{id}/retry-synthesis/stream",
            post(handlers::retry_synthesis_stream),
        )
        .route(
            "/api/conversations/{id}/pending",
            get(handlers::get_pending).delete(handlers::clear_pending),
        )
        .route(
            "/api/attachments",
            post(handlers::upload_attachment)
                .layer(DefaultBodyLimit::max(crate::attachments::MAX_PDF_SIZE + 1024)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until SIGTERM / ctrl-c, then drain open streams and exit.
pub async fn run(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "council server listening");

    let shutdown = state.shutdown.clone();
    let signal = async move {
        shutdown_signal().await;
        // Open streams get a server_shutdown event, then a bounded drain.
        shutdown.initiate();
        shutdown.drain(SHUTDOWN_GRACE).await;
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
