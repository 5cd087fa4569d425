use deadpool_postgres::{Config as PgConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_postgres::NoTls;
use url::Url;

use crate::api::middleware::AppError;
use crate::config::{PoolSettings, PostgresConfig};
use crate::storage::SqliteStorage;
use crate::validation::validate_identifier;

/// Pool size of the superuser engine; it only ever runs DDL and backend termination
const SUPERUSER_POOL_SIZE: usize = 4;

/// A pooled connection source for one physical database
pub struct PooledEngine {
    physical_name: String,
    pool: Pool,
    /// Milliseconds since the manager epoch at last checkout request
    last_used_ms: AtomicU64,
}

impl PooledEngine {
    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }

    /// Check a connection out of the pool. The connection goes back to the pool when dropped.
    pub async fn get(&self) -> Result<Object, AppError> {
        self.pool.get().await.map_err(|e| {
            AppError::Connection(format!(
                "Failed to get connection for database '{}': {}",
                self.physical_name, e
            ))
        })
    }

    fn touch(&self, epoch: Instant) {
        self.last_used_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Owns every engine the service talks to:
/// - the metadata store
/// - the superuser engine on the maintenance database (autocommit DDL only)
/// - one lazily created pool per physical database
///
/// Per-database pools are created at most once per name even under concurrent
/// first access, and the cache is bounded by `max_engines` with least recently
/// used eviction.
pub struct EngineManager {
    metadata: Arc<SqliteStorage>,
    superuser: Pool,
    app_url: Url,
    engines: RwLock<HashMap<String, Arc<PooledEngine>>>,
    max_pool_size: usize,
    max_engines: usize,
    epoch: Instant,
}

impl EngineManager {
    pub fn new(
        postgres: &PostgresConfig,
        settings: &PoolSettings,
        metadata: Arc<SqliteStorage>,
    ) -> Result<Self, AppError> {
        let app_url = Url::parse(&postgres.url)
            .map_err(|e| AppError::Validation(format!("Invalid POSTGRES_URL: {}", e)))?;
        if app_url.scheme() != "postgresql" && app_url.scheme() != "postgres" {
            return Err(AppError::Validation(
                "POSTGRES_URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        let superuser = Self::build_pool(&postgres.superuser_url, SUPERUSER_POOL_SIZE)?;
        tracing::info!(
            "Superuser engine configured for: {}",
            Self::mask_credentials(&postgres.superuser_url)
        );

        Ok(Self {
            metadata,
            superuser,
            app_url,
            engines: RwLock::new(HashMap::new()),
            max_pool_size: settings.max_size.max(1),
            max_engines: settings.max_engines.max(1),
            epoch: Instant::now(),
        })
    }

    /// The metadata store engine
    pub fn metadata(&self) -> Arc<SqliteStorage> {
        self.metadata.clone()
    }

    /// The superuser/maintenance engine. Only the provisioner should use it.
    pub fn superuser(&self) -> &Pool {
        &self.superuser
    }

    fn build_pool(url: &str, max_size: usize) -> Result<Pool, AppError> {
        let mut cfg = PgConfig::new();
        cfg.url = Some(url.to_string());
        // Verified recycling runs a liveness probe before a pooled connection is handed out
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create connection pool: {}", e);
                AppError::Connection(format!("Failed to create connection pool: {}", e))
            })?;
        pool.resize(max_size);
        Ok(pool)
    }

    fn url_for(&self, physical_name: &str) -> String {
        let mut url = self.app_url.clone();
        url.set_path(&format!("/{}", physical_name));
        url.to_string()
    }

    /// Get or create the engine for a physical database.
    /// This method is safe to call concurrently from multiple tasks.
    pub async fn get_engine(&self, physical_name: &str) -> Result<Arc<PooledEngine>, AppError> {
        // Fast path: check if engine already exists (read lock)
        {
            let engines = self.engines.read().await;
            if let Some(engine) = engines.get(physical_name) {
                engine.touch(self.epoch);
                return Ok(engine.clone());
            }
        }

        validate_identifier(physical_name)?;

        // Slow path: create new engine (write lock)
        let mut engines = self.engines.write().await;

        // Double-check in case another task created the engine while we were waiting
        if let Some(engine) = engines.get(physical_name) {
            tracing::debug!("Engine created by another task for: {}", physical_name);
            engine.touch(self.epoch);
            return Ok(engine.clone());
        }

        if engines.len() >= self.max_engines {
            Self::evict_lru(&mut engines);
        }

        let url = self.url_for(physical_name);
        tracing::info!(
            "Creating new engine for: {} (max_size: {})",
            Self::mask_credentials(&url),
            self.max_pool_size
        );

        let engine = Arc::new(PooledEngine {
            physical_name: physical_name.to_string(),
            pool: Self::build_pool(&url, self.max_pool_size)?,
            last_used_ms: AtomicU64::new(0),
        });
        engine.touch(self.epoch);
        engines.insert(physical_name.to_string(), engine.clone());

        Ok(engine)
    }

    fn evict_lru(engines: &mut HashMap<String, Arc<PooledEngine>>) {
        let oldest = engines
            .iter()
            .min_by_key(|(_, engine)| engine.last_used_ms.load(Ordering::Relaxed))
            .map(|(name, _)| name.clone());

        if let Some(name) = oldest {
            if let Some(engine) = engines.remove(&name) {
                engine.pool.close();
                tracing::info!("Evicted engine for: {}", name);
            }
        }
    }

    /// Drop and close the engine for a physical database (before it is dropped or renamed)
    pub async fn remove_engine(&self, physical_name: &str) -> bool {
        let mut engines = self.engines.write().await;
        match engines.remove(physical_name) {
            Some(engine) => {
                engine.pool.close();
                tracing::info!("Removed engine for: {}", physical_name);
                true
            }
            None => false,
        }
    }

    /// Retire pooled connections older than `max_lifetime`. Returns the number of engines visited.
    pub async fn recycle_stale(&self, max_lifetime: Duration) -> usize {
        let engines = self.engines.read().await;
        for engine in engines.values() {
            let _ = engine.pool.retain(|_, metrics| metrics.age() < max_lifetime);
        }
        let _ = self.superuser.retain(|_, metrics| metrics.age() < max_lifetime);
        engines.len()
    }

    /// Get the number of cached engines
    pub async fn engine_count(&self) -> usize {
        self.engines.read().await.len()
    }

    /// Mask credentials in connection URL for safe logging
    pub fn mask_credentials(url: &str) -> String {
        if let Ok(parsed_url) = Url::parse(url) {
            let mut masked = parsed_url.clone();
            if parsed_url.password().is_some() {
                let _ = masked.set_password(Some("***"));
            }
            masked.to_string()
        } else {
            "[invalid-url]".to_string()
        }
    }
}
