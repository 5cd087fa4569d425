pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use api::AppState;
use config::Config;
use services::{EngineManager, LlmService, PostgresProvisioner, TransactionCoordinator};
use storage::SqliteStorage;

/// Open the metadata store and wire every service for production use
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let storage = Arc::new(SqliteStorage::new(&config.metadata.url).await?);
    let engines = Arc::new(EngineManager::new(&config.postgres, &config.pool, storage)?);
    let app_role = url::Url::parse(&config.postgres.url)
        .ok()
        .map(|url| url.username().to_string());
    let provisioner = Arc::new(PostgresProvisioner::new(engines.superuser().clone(), app_role));
    let generator = Arc::new(LlmService::new(&config.llm)?);

    Ok(AppState::new(config, engines, provisioner, generator))
}

/// Background maintenance: idle transactions are rolled back and pooled
/// connections older than the configured lifetime are retired
pub fn spawn_maintenance(state: &AppState) {
    let coordinator: Arc<TransactionCoordinator> = state.coordinator.clone();
    let idle_timeout = state.config.transactions.idle_timeout();
    let sweep_every = Duration::from_secs(state.config.transactions.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let swept = coordinator.sweep_idle(idle_timeout).await;
            if swept > 0 {
                tracing::warn!("Rolled back {} idle transaction(s)", swept);
            }
        }
    });

    let engines = state.engines.clone();
    let max_lifetime = state.config.pool.max_lifetime();
    let recycle_every = Duration::from_secs(state.config.pool.recycle_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(recycle_every);
        loop {
            interval.tick().await;
            let visited = engines.recycle_stale(max_lifetime).await;
            tracing::debug!("Checked {} engine(s) for stale connections", visited);
        }
    });
}
