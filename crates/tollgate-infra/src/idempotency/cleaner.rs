//! Background sweeper for expired idempotency records.
//!
//! The cleaner runs one sweep as soon as it starts, then one per `interval`,
//! plus any sweep requested through [`CleanerHandle::trigger`]. Sweep failures
//! are logged and counted; the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tollgate_core::ports::{IdempotencyStore, StoreError, with_deadline};

/// Cleaner configuration.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Deadline for a single `delete_expired` call.
    pub timeout: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(30),
        }
    }
}

impl CleanerConfig {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(
                std::env::var("IDEMPOTENCY_CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(3600),
            ),
            ..Self::default()
        }
    }
}

/// Running totals published after every sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanerStats {
    /// Sweeps attempted, failed ones included.
    pub sweeps: u64,
    pub deleted_total: u64,
    pub errors: u64,
    pub last_deleted: u64,
    pub last_duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CleanerError {
    #[error("Cleaner did not stop within {0:?}")]
    ShutdownTimedOut(Duration),

    #[error("Cleaner task failed: {0}")]
    Join(String),
}

/// Periodic `delete_expired` driver.
pub struct IdempotencyCleaner {
    store: Arc<dyn IdempotencyStore>,
    config: CleanerConfig,
}

impl IdempotencyCleaner {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: CleanerConfig) -> Self {
        Self { store, config }
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        with_deadline(self.config.timeout, self.store.delete_expired()).await
    }

    /// Spawn the sweep loop.
    pub fn start(self) -> CleanerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats_tx, _) = watch::channel(CleanerStats::default());
        let trigger = Arc::new(Notify::new());

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Idempotency cleaner started"
        );

        let handle = tokio::spawn(self.run(shutdown_rx, stats_tx.clone(), trigger.clone()));

        CleanerHandle {
            shutdown: shutdown_tx,
            handle: Some(handle),
            trigger,
            stats: stats_tx,
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        stats: watch::Sender<CleanerStats>,
        trigger: Arc<Notify>,
    ) {
        // First tick completes immediately.
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped handle also counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = trigger.notified() => {}
            }

            let started = Instant::now();
            let result = self.sweep_once().await;
            let elapsed = started.elapsed();

            match &result {
                Ok(deleted) if *deleted > 0 => {
                    tracing::info!(
                        deleted,
                        duration_ms = elapsed.as_millis() as u64,
                        "Expired idempotency records removed"
                    );
                }
                Ok(_) => {
                    tracing::debug!(
                        duration_ms = elapsed.as_millis() as u64,
                        "No expired idempotency records"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Idempotency cleanup failed");
                }
            }

            stats.send_modify(|stats| {
                stats.sweeps += 1;
                stats.last_duration = elapsed;
                match result {
                    Ok(deleted) => {
                        stats.deleted_total += deleted;
                        stats.last_deleted = deleted;
                    }
                    Err(_) => {
                        stats.errors += 1;
                        stats.last_deleted = 0;
                    }
                }
            });
        }

        tracing::info!("Idempotency cleaner stopped");
    }
}

/// Control handle for a running cleaner.
///
/// Dropping the handle stops the loop once any in-progress sweep finishes.
pub struct CleanerHandle {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    trigger: Arc<Notify>,
    stats: watch::Sender<CleanerStats>,
}

impl CleanerHandle {
    /// Request an extra sweep without waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CleanerStats {
        self.stats.borrow().clone()
    }

    /// Receiver that changes after every sweep.
    pub fn subscribe(&self) -> watch::Receiver<CleanerStats> {
        self.stats.subscribe()
    }

    /// Stop the loop, letting a running sweep finish within `deadline`.
    pub async fn shutdown(mut self, deadline: Duration) -> Result<(), CleanerError> {
        let _ = self.shutdown.send(true);

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CleanerError::Join(e.to_string())),
            Err(_) => {
                handle.abort();
                tracing::warn!(?deadline, "Idempotency cleaner aborted after shutdown deadline");
                Err(CleanerError::ShutdownTimedOut(deadline))
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use tollgate_core::domain::IdempotencyRecord;

    /// Store double returning a fixed count per sweep.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicU64,
        per_sweep: u64,
        fail: AtomicBool,
        hang: bool,
    }

    #[async_trait]
    impl IdempotencyStore for CountingStore {
        async fn get(&self, _key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
            Ok(None)
        }

        async fn store(&self, _record: IdempotencyRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn complete(&self, _record: IdempotencyRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_expired(&self) -> Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            Ok(self.per_sweep)
        }
    }

    fn config() -> CleanerConfig {
        CleanerConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for_sweeps(rx: &mut watch::Receiver<CleanerStats>, sweeps: u64) -> CleanerStats {
        rx.wait_for(|stats| stats.sweeps >= sweeps)
            .await
            .unwrap()
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_immediately_then_on_interval() {
        let store = Arc::new(CountingStore {
            per_sweep: 2,
            ..Default::default()
        });
        let handle = IdempotencyCleaner::new(store.clone(), config()).start();
        let mut rx = handle.subscribe();

        let stats = wait_for_sweeps(&mut rx, 1).await;
        assert_eq!(stats.deleted_total, 2);
        assert_eq!(stats.last_deleted, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        let stats = wait_for_sweeps(&mut rx, 2).await;
        assert_eq!(stats.deleted_total, 4);

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_an_extra_sweep() {
        let store = Arc::new(CountingStore {
            per_sweep: 1,
            ..Default::default()
        });
        let handle = IdempotencyCleaner::new(store.clone(), config()).start();
        let mut rx = handle.subscribe();
        wait_for_sweeps(&mut rx, 1).await;

        let before = Instant::now();
        handle.trigger();
        let stats = wait_for_sweeps(&mut rx, 2).await;

        assert_eq!(stats.deleted_total, 2);
        assert!(before.elapsed() < Duration::from_secs(60));
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_retried() {
        let store = Arc::new(CountingStore {
            per_sweep: 3,
            fail: AtomicBool::new(true),
            ..Default::default()
        });
        let handle = IdempotencyCleaner::new(store.clone(), config()).start();
        let mut rx = handle.subscribe();

        let stats = wait_for_sweeps(&mut rx, 1).await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.deleted_total, 0);

        store.fail.store(false, Ordering::SeqCst);
        let stats = wait_for_sweeps(&mut rx, 2).await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.deleted_total, 3);

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_once_times_out() {
        let store = Arc::new(CountingStore {
            hang: true,
            ..Default::default()
        });
        let cleaner = IdempotencyCleaner::new(store, config());

        let err = cleaner.sweep_once().await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_deadline() {
        let store = Arc::new(CountingStore {
            hang: true,
            ..Default::default()
        });
        let cleaner = IdempotencyCleaner::new(
            store.clone(),
            CleanerConfig {
                interval: Duration::from_secs(60),
                timeout: Duration::from_secs(600),
            },
        );
        let handle = cleaner.start();

        // Let the first sweep begin and block.
        while store.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let result = handle.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CleanerError::ShutdownTimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_sweep() {
        let store = Arc::new(CountingStore {
            per_sweep: 1,
            ..Default::default()
        });
        let handle = IdempotencyCleaner::new(store.clone(), config()).start();
        let mut rx = handle.subscribe();
        wait_for_sweeps(&mut rx, 1).await;

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
