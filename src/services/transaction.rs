use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Object;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use uuid::Uuid;

use crate::api::middleware::AppError;

/// A connection that can hold a transaction open across requests
#[async_trait]
pub trait TransactionalConnection: Send + 'static {
    async fn begin(&mut self) -> Result<(), AppError>;
    async fn commit(&mut self) -> Result<(), AppError>;
    async fn rollback(&mut self) -> Result<(), AppError>;
}

async fn run_control(conn: &Object, statement: &str) -> Result<(), AppError> {
    conn.batch_execute(statement)
        .await
        .map_err(|e| AppError::Execution(format!("{} failed: {}", statement, e)))
}

#[async_trait]
impl TransactionalConnection for Object {
    async fn begin(&mut self) -> Result<(), AppError> {
        run_control(self, "BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), AppError> {
        run_control(self, "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), AppError> {
        run_control(self, "ROLLBACK").await
    }
}

/// An open transaction and the connection leased for it.
///
/// Ending the transaction empties the connection slot, so requests still
/// holding the lease can no longer reach the connection.
pub struct TransactionLease<C> {
    token: String,
    physical_name: String,
    user_id: String,
    conn: Mutex<Option<C>>,
    began_at: DateTime<Utc>,
    last_used_ms: AtomicU64,
}

impl<C> TransactionLease<C> {
    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Lock the connection. Statements on one lease run one at a time, in lock
    /// order. Fails once the transaction has ended.
    pub async fn connection(&self) -> Result<MappedMutexGuard<'_, C>, AppError> {
        MutexGuard::try_map(self.conn.lock().await, |slot| slot.as_mut())
            .map_err(|_| AppError::TransactionNotFound(self.token.clone()))
    }

    fn touch(&self, epoch: Instant) {
        self.last_used_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant) -> Duration {
        let now = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }
}

/// Token registry for transactions spanning several independent requests.
///
/// A token moves from open to closed exactly once: `end` removes it from the
/// registry under the lock before touching the connection, so a concurrent
/// second `end` sees `TransactionNotFound`.
pub struct TransactionCoordinator<C = Object> {
    leases: Mutex<HashMap<String, Arc<TransactionLease<C>>>>,
    epoch: Instant,
}

impl<C: TransactionalConnection> Default for TransactionCoordinator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: TransactionalConnection> TransactionCoordinator<C> {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Start a transaction on `conn` and register it under a fresh token.
    /// If `BEGIN` fails nothing is registered and the connection is released.
    pub async fn begin(
        &self,
        mut conn: C,
        physical_name: &str,
        user_id: &str,
    ) -> Result<String, AppError> {
        conn.begin().await?;

        let token = Uuid::new_v4().to_string();
        let lease = Arc::new(TransactionLease {
            token: token.clone(),
            physical_name: physical_name.to_string(),
            user_id: user_id.to_string(),
            conn: Mutex::new(Some(conn)),
            began_at: Utc::now(),
            last_used_ms: AtomicU64::new(0),
        });
        lease.touch(self.epoch);

        self.leases.lock().await.insert(token.clone(), lease);
        tracing::info!("Began transaction {} on {} for user {}", token, physical_name, user_id);
        Ok(token)
    }

    /// Look up an open transaction. Counts as activity for the idle sweep.
    pub async fn get(&self, token: &str) -> Result<Arc<TransactionLease<C>>, AppError> {
        let leases = self.leases.lock().await;
        let lease = leases
            .get(token)
            .ok_or_else(|| AppError::TransactionNotFound(token.to_string()))?;
        lease.touch(self.epoch);
        Ok(lease.clone())
    }

    async fn take(
        &self,
        token: &str,
        opener: Option<&str>,
    ) -> Result<Arc<TransactionLease<C>>, AppError> {
        let mut leases = self.leases.lock().await;
        match leases.get(token) {
            None => Err(AppError::TransactionNotFound(token.to_string())),
            Some(lease) if opener.is_some_and(|user| user != lease.user_id) => {
                Err(AppError::PermissionDenied(
                    "Only the user who began a transaction can end it".to_string(),
                ))
            }
            Some(_) => leases
                .remove(token)
                .ok_or_else(|| AppError::TransactionNotFound(token.to_string())),
        }
    }

    async fn finish(lease: Arc<TransactionLease<C>>, commit: bool) -> Result<(), AppError> {
        let result = {
            let mut slot = lease.conn.lock().await;
            let result = match slot.as_mut() {
                Some(conn) if commit => conn.commit().await,
                Some(conn) => conn.rollback().await,
                None => Err(AppError::TransactionNotFound(lease.token.clone())),
            };
            // Released on every path
            drop(slot.take());
            result
        };
        match &result {
            Ok(()) => tracing::info!(
                "{} transaction {}",
                if commit { "Committed" } else { "Rolled back" },
                lease.token
            ),
            Err(e) => tracing::error!("Ending transaction {} failed: {}", lease.token, e),
        }
        result
    }

    /// Commit or roll back and release the connection. Tokens are single use.
    pub async fn end(&self, token: &str, commit: bool) -> Result<(), AppError> {
        let lease = self.take(token, None).await?;
        Self::finish(lease, commit).await
    }

    /// Same as `end`, but only the user that opened the transaction may end it
    pub async fn end_as(&self, token: &str, user_id: &str, commit: bool) -> Result<(), AppError> {
        let lease = self.take(token, Some(user_id)).await?;
        Self::finish(lease, commit).await
    }

    /// Roll back and release every transaction idle for longer than `max_idle`.
    /// Returns how many were swept.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Arc<TransactionLease<C>>> = {
            let mut leases = self.leases.lock().await;
            let tokens: Vec<String> = leases
                .values()
                .filter(|lease| lease.idle_for(self.epoch) > max_idle)
                .map(|lease| lease.token.clone())
                .collect();
            tokens.iter().filter_map(|t| leases.remove(t)).collect()
        };

        let count = expired.len();
        let results = futures::future::join_all(expired.into_iter().map(|lease| {
            tracing::warn!(
                "Rolling back idle transaction {} on {} (opened {})",
                lease.token,
                lease.physical_name,
                lease.began_at
            );
            Self::finish(lease, false)
        }))
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!("{} idle transactions failed to roll back cleanly", failed);
        }
        count
    }

    pub async fn open_count(&self) -> usize {
        self.leases.lock().await.len()
    }
}
