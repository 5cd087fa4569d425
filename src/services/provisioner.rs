// Database-level DDL against the cluster, executed through the superuser engine
use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::api::middleware::AppError;
use crate::validation::{quote_identifier, quoted};

/// Physical database lifecycle operations.
///
/// Implementations run every statement in autocommit mode: `CREATE/DROP/ALTER
/// DATABASE` cannot run inside a transaction block, so none of these can be
/// rolled back by the caller.
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    async fn create_database(&self, physical_name: &str) -> Result<(), AppError>;

    /// Forcibly terminate every other backend connected to the database.
    /// Returns the number of terminated backends.
    async fn terminate_backends(&self, physical_name: &str) -> Result<u64, AppError>;

    async fn drop_database(&self, physical_name: &str) -> Result<(), AppError>;

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), AppError>;
}

/// PostgreSQL provisioner backed by the superuser pool
pub struct PostgresProvisioner {
    pool: Pool,
    /// Role that owns new databases, so the application role can create tables in them
    owner_role: Option<String>,
}

impl PostgresProvisioner {
    pub fn new(pool: Pool, owner_role: Option<String>) -> Self {
        Self {
            pool,
            owner_role: owner_role.filter(|r| !r.is_empty()),
        }
    }

    async fn run_ddl(&self, statement: &str) -> Result<(), AppError> {
        let client = self.pool.get().await.map_err(|e| {
            AppError::Connection(format!("Failed to get superuser connection: {}", e))
        })?;
        // A fresh pooled client is never inside a transaction block, so this is autocommit
        client.batch_execute(statement).await.map_err(|e| {
            let message = e
                .as_db_error()
                .map(|db| format!("{} ({})", db.message(), db.code().code()))
                .unwrap_or_else(|| e.to_string());
            tracing::error!("DDL failed: {} -- {}", statement, message);
            AppError::Execution(message)
        })
    }
}

#[async_trait]
impl DatabaseProvisioner for PostgresProvisioner {
    async fn create_database(&self, physical_name: &str) -> Result<(), AppError> {
        let mut statement = format!("CREATE DATABASE {}", quoted(physical_name)?);
        if let Some(owner) = &self.owner_role {
            statement.push_str(&format!(" OWNER {}", quote_identifier(owner)));
        }
        self.run_ddl(&statement).await
    }

    async fn terminate_backends(&self, physical_name: &str) -> Result<u64, AppError> {
        let client = self.pool.get().await.map_err(|e| {
            AppError::Connection(format!("Failed to get superuser connection: {}", e))
        })?;
        let rows = client
            .query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&physical_name],
            )
            .await
            .map_err(|e| AppError::Execution(format!("Failed to terminate backends: {}", e)))?;
        Ok(rows.len() as u64)
    }

    async fn drop_database(&self, physical_name: &str) -> Result<(), AppError> {
        self.run_ddl(&format!("DROP DATABASE {}", quoted(physical_name)?))
            .await
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.run_ddl(&format!(
            "ALTER DATABASE {} RENAME TO {}",
            quoted(from)?,
            quoted(to)?
        ))
        .await
    }
}
