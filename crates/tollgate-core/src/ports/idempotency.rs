//! Idempotency record store port.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::IdempotencyRecord;

/// Durable keyed store holding one record per idempotency key.
///
/// Implementations must guarantee:
/// - `get` never returns a record whose `expires_at` has passed, even if it is
///   still physically present;
/// - `store` is atomic with respect to key uniqueness and fails with
///   [`StoreError::AlreadyExists`] instead of overwriting a live record;
/// - `complete` replaces a pending claim (or a missing or expired record) but
///   fails with [`StoreError::AlreadyExists`] over a live completed record;
/// - `delete_expired` removes every record with `expires_at <= now`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the live record for `key`, pending or completed.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert a new record, usually a pending claim.
    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Write the completed record over its pending claim.
    async fn complete(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Delete all expired records, returning how many were removed.
    async fn delete_expired(&self) -> Result<u64, StoreError>;
}

/// Store operation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Record already exists for key {0}")]
    AlreadyExists(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Run a store call under a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}
