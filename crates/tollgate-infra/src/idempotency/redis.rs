//! Redis idempotency store using `SET NX PX` for atomic inserts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use tollgate_core::domain::IdempotencyRecord;
use tollgate_core::ports::{IdempotencyStore, StoreError};

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Prefix for record keys
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            key_prefix: "idempotency".to_string(),
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            key_prefix: std::env::var("IDEMPOTENCY_KEY_PREFIX")
                .unwrap_or_else(|_| "idempotency".to_string()),
        }
    }
}

/// Overwrites KEYS[1] unless it holds a completed record. Returns 1 on write.
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local ok, existing = pcall(cjson.decode, current)
    if ok and existing['state'] == 'completed' then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// Milliseconds until `record` expires. Redis cannot hold an already
/// expired value, so such a record is refused.
fn remaining_ttl_ms(record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<i64, StoreError> {
    let ttl_ms = (record.expires_at - now).num_milliseconds();
    if ttl_ms <= 0 {
        return Err(StoreError::Backend(format!(
            "Record for key {} is already expired",
            record.key
        )));
    }
    Ok(ttl_ms)
}

/// Redis-backed record store.
///
/// Each record is a JSON value whose Redis TTL matches `expires_at`, so Redis
/// drops expired records by itself.
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    config: RedisConfig,
}

impl RedisIdempotencyStore {
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Backend(e.to_string()))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Backend("Connection timed out".to_string()))?
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::info!(url = %config.url, "Connected to Redis idempotency store");

        Ok(Self { conn, config })
    }

    /// Create from environment configuration.
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::new(RedisConfig::from_env()).await
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.redis_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let record: IdempotencyRecord = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Backend(format!("Corrupt record for key {key}: {e}")))?;

        // Redis expiry has millisecond resolution; never hand out a stale record.
        if record.is_expired() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let ttl_ms = remaining_ttl_ms(&record, Utc::now())?;
        let payload =
            serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(&record.key))
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match reply {
            Some(_) => Ok(()),
            None => Err(StoreError::AlreadyExists(record.key)),
        }
    }

    async fn complete(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let ttl_ms = remaining_ttl_ms(&record, Utc::now())?;
        let payload =
            serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut conn = self.conn.clone();
        let written: i64 = Script::new(COMPLETE_SCRIPT)
            .key(self.redis_key(&record.key))
            .arg(payload)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if written == 1 {
            Ok(())
        } else {
            Err(StoreError::AlreadyExists(record.key))
        }
    }

    async fn delete_expired(&self) -> Result<u64, StoreError> {
        // Redis evicts expired keys on its own.
        Ok(0)
    }
}
