mod comments;
mod notifier;
mod problem;
mod router;
mod scopes;
mod service;
mod telemetry;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use comment_service_core::{CommentStore, IdentityMentionResolver, MarkdownRenderer};
use comment_service_idm::IdmClient;
use comment_service_storage::Database;
use comment_service_util::{load_env_file, AppConfig};
use tracing::info;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let http = reqwest::Client::builder()
        .timeout(config.notify_timeout)
        .build()?;
    let idm = Arc::new(IdmClient::new(Url::parse(&config.idm_url)?, http));

    let store: Arc<dyn CommentStore> = Arc::new(database);
    let renderer = MarkdownRenderer::new(Arc::new(IdentityMentionResolver::new(idm.clone())));
    let dispatcher = notifier::Dispatcher::new(
        store.clone(),
        idm.clone(),
        idm,
        renderer.clone(),
        config.notify_timeout,
    );
    let service = service::CommentService::new(store, renderer, dispatcher);
    let state = router::AppState::new(metrics, service);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), idm = %config.idm_url, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
