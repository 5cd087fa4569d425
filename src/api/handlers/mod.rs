pub mod collaboration;
pub mod command;
pub mod history;
pub mod transaction;
pub mod virtual_database;

use axum::http::HeaderMap;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::services::{
    CollaborationService, CommandService, DatabaseProvisioner, EngineManager, HistoryService,
    SqlGenerator, TransactionCoordinator, VirtualDatabaseRegistry,
};
use crate::storage::SqliteStorage;

pub const TARGET_DATABASE_HEADER: &str = "x-target-database";
pub const TRANSACTION_ID_HEADER: &str = "x-transaction-id";

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<SqliteStorage>,
    pub engines: Arc<EngineManager>,
    pub registry: Arc<VirtualDatabaseRegistry>,
    pub collaboration: Arc<CollaborationService>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub history: Arc<HistoryService>,
    pub commands: Arc<CommandService>,
}

impl AppState {
    /// Wire every service over one metadata store and one engine manager
    pub fn new(
        config: Config,
        engines: Arc<EngineManager>,
        provisioner: Arc<dyn DatabaseProvisioner>,
        generator: Arc<dyn SqlGenerator>,
    ) -> Self {
        let storage = engines.metadata();
        let registry = Arc::new(VirtualDatabaseRegistry::new(
            storage.clone(),
            provisioner,
            engines.clone(),
        ));
        let coordinator = Arc::new(TransactionCoordinator::new());
        let history = Arc::new(HistoryService::new(storage.clone()));
        let commands = Arc::new(CommandService::new(
            engines.clone(),
            registry.clone(),
            coordinator.clone(),
            history.clone(),
            generator,
        ));

        Self {
            config,
            collaboration: Arc::new(CollaborationService::new(storage.clone())),
            storage,
            engines,
            registry,
            coordinator,
            history,
            commands,
        }
    }
}

/// Optional header value, trimmed; blank counts as absent
pub(crate) fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub(crate) fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    optional_header(headers, name)
        .ok_or_else(|| AppError::Validation(format!("Missing required header: {}", name)))
}
