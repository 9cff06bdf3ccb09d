pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod ingest;
pub(crate) mod progress;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tokio::sync::watch;

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::progress::{ProgressHub, UrlPresigner};
use crate::services::storage::StorageService;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; topic consumer will retry");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let presigner: Option<Arc<dyn UrlPresigner>> =
        match StorageService::from_settings(settings.s3()).await? {
            Some(storage) => Some(Arc::new(storage)),
            None => {
                tracing::warn!("S3 not configured; unknown-id images are not presigned");
                None
            }
        };
    let hub = ProgressHub::from_settings(&settings, presigner);
    let state = AppState::new(settings, redis.clone(), hub);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tasks::scheduler::spawn(&state, shutdown_rx).await;

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Gradi progress server listening"
    );

    let hub = state.hub().clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            core::shutdown::shutdown_signal().await;
            if shutdown_tx.send(true).is_err() {
                tracing::warn!("Failed to broadcast shutdown signal to background tasks");
            }
            // Open SSE responses never finish on their own.
            let closed = hub.registry().close_all();
            tracing::info!(closed, "Closed SSE streams");
        })
        .await;

    tasks::scheduler::join(workers).await;
    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
