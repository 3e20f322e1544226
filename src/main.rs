//! Council server binary.

use llm_council::attachments::AttachmentStore;
use llm_council::auth::TrustedProxies;
use llm_council::catalog::ModelCatalog;
use llm_council::config::{LogFormat, Settings};
use llm_council::gateway::{openrouter::shared_client, BackoffConfig, OpenRouterGateway, DEFAULT_CALL_TIMEOUT};
use llm_council::pending::PendingTracker;
use llm_council::pipeline::PipelineCtx;
use llm_council::server::{self, AppState};
use llm_council::shutdown::ShutdownCoordinator;
use llm_council::storage::ConversationStore;
use llm_council::websearch::WebSearch;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Human => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    init_tracing(settings.log_format);

    if settings.gateway_api_key.is_empty() {
        tracing::warn!("OPENROUTER_API_KEY is not set; upstream calls will fail");
    }

    let client = shared_client(DEFAULT_CALL_TIMEOUT);
    let gateway = Arc::new(OpenRouterGateway::new(
        client.clone(),
        settings.gateway_api_url.clone(),
        settings.gateway_api_key.clone(),
    ));
    let catalog = Arc::new(ModelCatalog::new(
        client.clone(),
        settings.gateway_models_url.clone(),
        settings.gateway_api_key.clone(),
    ));
    let proxies = Arc::new(TrustedProxies::parse(
        &settings.trusted_proxy_ips,
        settings.auth_enabled,
    ));

    let ctx = PipelineCtx {
        gateway,
        backoff: BackoffConfig::standard(),
        store: ConversationStore::new(&settings.data_dir),
        pending: PendingTracker::new(&settings.data_dir),
        attachments: AttachmentStore::new(&settings.data_dir),
        search: WebSearch::new(client, settings.websearch_api_key.clone()),
        settings: settings.clone(),
    };

    let state = AppState {
        ctx,
        catalog,
        proxies,
        shutdown: ShutdownCoordinator::new(),
    };

    server::run(state, &settings.bind_addr).await
}
