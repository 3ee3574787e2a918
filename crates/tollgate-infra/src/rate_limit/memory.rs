//! In-memory, key-scoped rate limiter backed by one token bucket per key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tollgate_core::domain::Rate;
use tollgate_core::ports::{RateLimitError, RateLimiter};

use super::bucket::TokenBucket;

/// In-memory rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Rate used for keys without an override.
    pub default_rate: Rate,
    /// Buckets untouched for this long are dropped by the sweeper.
    pub idle_timeout: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rate: Rate::default(),
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_requests: f64 = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100.0);
        let window = Duration::from_secs(
            std::env::var("RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        );
        let default_rate = match Rate::new(max_requests, window) {
            Ok(rate) => rate,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid default rate in environment, using {}", defaults.default_rate);
                defaults.default_rate
            }
        };

        Self {
            default_rate,
            idle_timeout: Duration::from_secs(
                std::env::var("RATE_LIMIT_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("RATE_LIMIT_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Per-key token buckets held in a sharded map.
///
/// Buckets are created lazily on the first `allow` for a key, at the key's
/// override rate if one is registered and at the default rate otherwise.
/// Limits are per-process, not distributed across instances.
pub struct InMemoryRateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    overrides: DashMap<String, Rate>,
    config: RateLimitConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl InMemoryRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            overrides: DashMap::new(),
            config,
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(RateLimitConfig::from_env())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn effective_rate(&self, key: &str) -> Rate {
        self.overrides
            .get(key)
            .map(|rate| *rate)
            .unwrap_or(self.config.default_rate)
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets idle for at least `idle_timeout`. Overrides are kept.
    pub fn evict_idle(&self) -> usize {
        evict_idle(&self.buckets, self.config.idle_timeout)
    }

    /// Spawn the idle sweeper. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let buckets = self.buckets.clone();
        let idle_timeout = self.config.idle_timeout;
        let sweep_interval = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let evicted = evict_idle(&buckets, idle_timeout);
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = buckets.len(), "Evicted idle rate limit buckets");
                        }
                    }
                }
            }

            tracing::debug!("Rate limit sweeper stopped");
        });

        *sweeper = Some(Sweeper { shutdown, handle });
        tracing::info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            sweep_interval_secs = sweep_interval.as_secs(),
            "Rate limit sweeper started"
        );
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        let Some(sweeper) = sweeper else {
            return;
        };

        let _ = sweeper.shutdown.send(true);
        if let Err(e) = sweeper.handle.await {
            tracing::warn!(error = %e, "Rate limit sweeper did not exit cleanly");
        }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl Drop for InMemoryRateLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.handle.abort();
        }
    }
}

fn evict_idle(buckets: &DashMap<String, TokenBucket>, idle_timeout: Duration) -> usize {
    let now = Instant::now();
    let before = buckets.len();
    buckets.retain(|_, bucket| bucket.idle_for(now) < idle_timeout);
    before.saturating_sub(buckets.len())
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        if let Some(bucket) = self.buckets.get(key) {
            return Ok(bucket.allow());
        }

        // The rate is read under the shard lock, so a concurrent `limit`
        // either lands before creation or finds the bucket to reseed.
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::from_rate(&self.effective_rate(key)));
        Ok(bucket.allow())
    }

    async fn limit(&self, key: &str, rate: Rate) -> Result<(), RateLimitError> {
        self.overrides.insert(key.to_string(), rate);
        if let Some(bucket) = self.buckets.get(key) {
            bucket.reseed(&rate);
        }
        tracing::debug!(key = %key, rate = %rate, "Rate override registered");
        Ok(())
    }

    async fn retry_after(&self, key: &str) -> u64 {
        self.buckets
            .get(key)
            .map(|bucket| bucket.retry_after())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(permits: f64, per: Duration) -> InMemoryRateLimiter {
        InMemoryRateLimiter::new(RateLimitConfig {
            default_rate: Rate::new(permits, per).unwrap(),
            idle_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_rate_applies_per_key() {
        let limiter = limiter(2.0, Duration::from_secs(1));

        let mut decisions = Vec::new();
        for _ in 0..4 {
            decisions.push(limiter.allow("client").await.unwrap());
        }
        assert_eq!(decisions, vec![true, true, false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_isolated() {
        let limiter = limiter(1.0, Duration::from_secs(60));

        assert!(limiter.allow("a").await.unwrap());
        assert!(!limiter.allow("a").await.unwrap());
        assert!(limiter.allow("b").await.unwrap());
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_applies_to_new_bucket() {
        let limiter = limiter(1.0, Duration::from_secs(60));
        limiter.limit("vip", Rate::per_second(3.0).unwrap()).await.unwrap();

        let mut allowed = 0;
        for _ in 0..5 {
            if limiter.allow("vip").await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_reseeds_existing_bucket() {
        let limiter = limiter(10.0, Duration::from_secs(1));
        assert!(limiter.allow("k").await.unwrap());

        limiter.limit("k", Rate::per_second(1.0).unwrap()).await.unwrap();
        assert!(limiter.allow("k").await.unwrap());
        assert!(!limiter.allow("k").await.unwrap());
        assert_eq!(limiter.retry_after("k").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_unknown_key_is_zero() {
        let limiter = limiter(1.0, Duration::from_secs(1));
        assert_eq!(limiter.retry_after("nobody").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_matches_allow() {
        let limiter = limiter(1.0, Duration::from_secs(2));
        assert!(limiter.allow("k").await.unwrap());
        assert_eq!(limiter.retry_after("k").await, 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.retry_after("k").await, 0);
        assert!(limiter.allow("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_keeps_active_buckets_and_overrides() {
        let limiter = limiter(5.0, Duration::from_secs(1));
        limiter.limit("idle", Rate::per_second(1.0).unwrap()).await.unwrap();
        limiter.allow("idle").await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        limiter.allow("busy").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.bucket_count(), 1);

        // The override outlives its evicted bucket.
        assert!(limiter.allow("idle").await.unwrap());
        assert!(!limiter.allow("idle").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_and_stops() {
        let limiter = limiter(5.0, Duration::from_secs(1));
        limiter.start();
        limiter.allow("k").await.unwrap();
        assert_eq!(limiter.bucket_count(), 1);

        // Idle for 10s by the second tick.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(limiter.bucket_count(), 0);

        limiter.stop().await;
        assert!(limiter.sweeper.lock().is_none());
        // Stopping twice is harmless.
        limiter.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_override_racing_first_allow_is_never_lost() {
        let limiter = Arc::new(limiter(10.0, Duration::from_secs(1)));
        let vip = Rate::per_second(2.0).unwrap();

        for i in 0..200 {
            let key = format!("racer-{i}");
            let allow = {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.allow(&key).await.unwrap() })
            };
            let limit = {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.limit(&key, vip).await.unwrap() })
            };
            allow.await.unwrap();
            limit.await.unwrap();

            let capacity = limiter.buckets.get(&key).map(|b| b.capacity());
            assert_eq!(capacity, Some(2.0), "{key}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_bucket() {
        let limiter = Arc::new(limiter(50.0, Duration::from_secs(3600)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let mut allowed = 0;
                    for _ in 0..20 {
                        if limiter.allow("shared").await.unwrap() {
                            allowed += 1;
                        }
                    }
                    allowed
                })
            })
            .collect();

        let total: usize = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();
        assert_eq!(total, 50);
    }
}
