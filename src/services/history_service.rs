use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{HistoryStatus, QueryHistory, User};
use crate::storage::SqliteStorage;
use crate::validation::leading_keyword;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Per-user command history; successful entries double as a cache for
/// parameter-less natural-language commands
pub struct HistoryService {
    storage: Arc<SqliteStorage>,
}

impl HistoryService {
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self { storage }
    }

    /// Record an execution. An older entry for the same SQL is replaced.
    pub async fn log(
        &self,
        user: &User,
        command: &str,
        sql: &str,
        status: HistoryStatus,
    ) -> Result<i64, AppError> {
        let query_type = leading_keyword(sql);
        let id = self
            .storage
            .add_history(&user.id, command, sql, status, &query_type)
            .await?;
        tracing::debug!("Logged {} history entry {} for user {}", status.as_str(), id, user.id);
        Ok(id)
    }

    /// Most recent successful run of exactly this command text
    pub async fn find_cached(&self, user: &User, command: &str) -> Result<Option<QueryHistory>, AppError> {
        let hit = self.storage.find_successful_history(&user.id, command).await?;
        if hit.is_some() {
            tracing::debug!("History cache hit for user {}", user.id);
        }
        Ok(hit)
    }

    pub async fn list(&self, user: &User, limit: usize) -> Result<Vec<QueryHistory>, AppError> {
        Ok(self.storage.list_history(&user.id, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sets_query_type_and_dedups() {
        let service = HistoryService::new(Arc::new(SqliteStorage::in_memory().await.unwrap()));
        let user = User::new("alice@example.com", "Alice");

        service
            .log(&user, "count orders", "select count(*) from orders;", HistoryStatus::Error)
            .await
            .unwrap();
        assert!(service.find_cached(&user, "count orders").await.unwrap().is_none());

        service
            .log(&user, "count orders", "select count(*) from orders;", HistoryStatus::Success)
            .await
            .unwrap();
        let entries = service.list(&user, DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_type, "SELECT");

        let hit = service.find_cached(&user, "count orders").await.unwrap().unwrap();
        assert_eq!(hit.generated_sql, "select count(*) from orders;");
    }
}
