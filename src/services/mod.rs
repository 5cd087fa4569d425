pub mod authorization;
pub mod collaboration;
pub mod command_service;
pub mod engine_pool; // Per-database connection pools with LRU eviction
pub mod history_service;
pub mod llm_service;
pub mod provisioner;
pub mod registry;
pub mod sql_executor;
pub mod template_cache;
pub mod transaction;

pub use collaboration::CollaborationService;
pub use command_service::{CommandPlan, CommandService, CommandSource};
pub use engine_pool::{EngineManager, PooledEngine};
pub use history_service::{HistoryService, DEFAULT_HISTORY_LIMIT};
pub use llm_service::{GeneratedSql, LlmService, NlpResponse, SchemaReader, SqlGenerator};
pub use provisioner::{DatabaseProvisioner, PostgresProvisioner};
pub use registry::VirtualDatabaseRegistry;
pub use template_cache::TemplateCache;
pub use transaction::TransactionCoordinator;
