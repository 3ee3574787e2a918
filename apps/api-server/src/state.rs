//! Application state - shared across all workers.

use std::sync::Arc;

use tollgate_core::ports::{IdempotencyStore, RateLimiter};
use tollgate_core::services::IdempotencyCoordinator;
use tollgate_infra::{InMemoryIdempotencyStore, InMemoryRateLimiter};

use crate::config::{AppConfig, StoreKind};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<InMemoryRateLimiter>,
    pub store: Arc<dyn IdempotencyStore>,
    pub coordinator: Arc<IdempotencyCoordinator>,
    /// Store actually in use, after any fallback.
    pub store_kind: StoreKind,
}

impl AppState {
    /// Build the application state with appropriate implementations.
    pub async fn new(config: &AppConfig) -> Self {
        let limiter = Arc::new(InMemoryRateLimiter::new(config.rate_limit.clone()));
        for (key, rate) in &config.rate_overrides {
            if let Err(e) = limiter.limit(key, *rate).await {
                tracing::error!(key = %key, error = %e, "Failed to register rate override");
            }
        }
        tracing::info!(
            default_rate = %config.rate_limit.default_rate,
            overrides = config.rate_overrides.len(),
            "Rate limiter initialized"
        );

        let (store, store_kind) = build_store(config.store).await;
        let coordinator = Arc::new(IdempotencyCoordinator::new(
            store.clone(),
            config.idempotency.clone(),
        ));

        tracing::info!(store = store_kind.as_str(), "Application state initialized");

        Self {
            limiter,
            store,
            coordinator,
            store_kind,
        }
    }
}

fn memory_store() -> (Arc<dyn IdempotencyStore>, StoreKind) {
    (Arc::new(InMemoryIdempotencyStore::new()), StoreKind::Memory)
}

async fn build_store(kind: StoreKind) -> (Arc<dyn IdempotencyStore>, StoreKind) {
    match kind {
        StoreKind::Memory => memory_store(),
        StoreKind::Postgres => postgres_store().await,
        StoreKind::Redis => redis_store().await,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_store() -> (Arc<dyn IdempotencyStore>, StoreKind) {
    use tollgate_infra::{DatabaseConfig, PostgresIdempotencyStore};

    let Some(config) = DatabaseConfig::from_env() else {
        tracing::warn!("DATABASE_URL not set. Using in-memory idempotency store.");
        return memory_store();
    };

    match config.connect().await {
        Ok(conn) => (
            Arc::new(PostgresIdempotencyStore::new(conn)),
            StoreKind::Postgres,
        ),
        Err(e) => {
            tracing::error!(
                "Failed to connect to database: {}. Using in-memory fallback.",
                e
            );
            memory_store()
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn postgres_store() -> (Arc<dyn IdempotencyStore>, StoreKind) {
    tracing::warn!("Built without postgres feature - using in-memory idempotency store");
    memory_store()
}

#[cfg(feature = "redis")]
async fn redis_store() -> (Arc<dyn IdempotencyStore>, StoreKind) {
    use tollgate_infra::RedisIdempotencyStore;

    match RedisIdempotencyStore::from_env().await {
        Ok(store) => (Arc::new(store), StoreKind::Redis),
        Err(e) => {
            tracing::error!(
                "Failed to connect to Redis: {}. Using in-memory fallback.",
                e
            );
            memory_store()
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn redis_store() -> (Arc<dyn IdempotencyStore>, StoreKind) {
    tracing::warn!("Built without redis feature - using in-memory idempotency store");
    memory_store()
}
