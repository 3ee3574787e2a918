//! Application configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use tollgate_core::domain::Rate;
use tollgate_core::services::IdempotencyConfig;
use tollgate_infra::{CleanerConfig, RateLimitConfig};

use crate::middleware::RateLimitOptions;

/// Which idempotency record store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
    Redis,
}

impl StoreKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Some(StoreKind::Memory),
            "postgres" | "postgresql" => Some(StoreKind::Postgres),
            "redis" => Some(StoreKind::Redis),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Postgres => "postgres",
            StoreKind::Redis => "redis",
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit: RateLimitConfig,
    pub rate_limit_options: RateLimitOptions,
    /// Per-key rates registered at startup.
    pub rate_overrides: Vec<(String, Rate)>,
    pub idempotency: IdempotencyConfig,
    pub cleaner: CleanerConfig,
    pub store: StoreKind,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
    /// App-wide request body limit. Keyed bodies are buffered before routing,
    /// so this is the limit they see.
    pub max_body_bytes: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let store = env::var("IDEMPOTENCY_STORE")
            .ok()
            .map(|raw| {
                StoreKind::parse(&raw).unwrap_or_else(|| {
                    tracing::warn!(value = %raw, "Unknown IDEMPOTENCY_STORE, using memory");
                    StoreKind::Memory
                })
            })
            .unwrap_or(StoreKind::Memory);

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            rate_limit: RateLimitConfig::from_env(),
            rate_limit_options: RateLimitOptions::from_env(),
            rate_overrides: env::var("RATE_LIMIT_OVERRIDES")
                .map(|raw| parse_rate_overrides(&raw))
                .unwrap_or_default(),
            idempotency: IdempotencyConfig::from_env(),
            cleaner: CleanerConfig::from_env(),
            store,
            shutdown_timeout: Duration::from_secs(
                env::var("SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            max_body_bytes: env::var("MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256 * 1024),
        }
    }
}

/// Parse per-key rates.
/// Format: `<key>=<permits>/<seconds>` entries separated by `;`
/// Example: `RATE_LIMIT_OVERRIDES=user:42=1000/60;ip:10.0.0.1=5/1`
///
/// The key is everything before the last `=`. Malformed entries are skipped.
pub fn parse_rate_overrides(raw: &str) -> Vec<(String, Rate)> {
    let mut overrides = Vec::new();

    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry.rsplit_once('=').and_then(|(key, rate)| {
            let (permits, secs) = rate.split_once('/')?;
            let permits: f64 = permits.trim().parse().ok()?;
            let secs: f64 = secs.trim().parse().ok()?;
            let window = Duration::try_from_secs_f64(secs).ok()?;
            let rate = Rate::new(permits, window).ok()?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), rate))
        });

        match parsed {
            Some(entry) => overrides.push(entry),
            None => tracing::warn!(entry = %entry, "Skipping malformed rate override"),
        }
    }

    overrides
}
