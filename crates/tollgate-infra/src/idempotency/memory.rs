//! In-memory idempotency store - used when no durable store is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use tollgate_core::domain::IdempotencyRecord;
use tollgate_core::ports::{IdempotencyStore, StoreError};

/// In-memory record store using a HashMap with async RwLock.
///
/// Note: Records are lost on process restart and are not shared between
/// instances.
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of physically present records, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let records = self.records.read().await;
        // Expired records stay until the cleaner removes them.
        Ok(records
            .get(key)
            .filter(|record| !record.is_expired())
            .cloned())
    }

    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&record.key) {
            if !existing.is_expired() {
                return Err(StoreError::AlreadyExists(record.key));
            }
        }

        records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn complete(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&record.key) {
            if !existing.is_expired() && !existing.is_pending() {
                return Err(StoreError::AlreadyExists(record.key));
            }
        }

        records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}
