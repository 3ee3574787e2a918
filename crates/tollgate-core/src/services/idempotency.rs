//! Claim-run-complete protocol around a mutating request.
//!
//! For a given key the coordinator either claims the key and runs the handler
//! once, replays the completed response, or rejects the request when the key
//! was already used for a different request. The claim is the store's atomic
//! insert; the coordinator keeps no state between calls, so several processes
//! can share one store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{CapturedResponse, FailureMode, IdempotencyRecord, KeyFormat, RequestFingerprint};
use crate::error::DomainError;
use crate::ports::{IdempotencyStore, StoreError, with_deadline};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a completed response stays replayable.
    pub ttl: Duration,
    /// How long a pending claim holds its key if it is never completed.
    pub claim_ttl: Duration,
    /// How long a duplicate waits for an in-flight request before giving up.
    pub in_flight_wait: Duration,
    /// Delay between lookups while waiting on an in-flight request.
    pub poll_interval: Duration,
    /// Deadline applied to every store call.
    pub store_timeout: Duration,
    /// Behaviour when the store errors or times out.
    pub on_store_failure: FailureMode,
    /// Accepted key shape.
    pub key_format: KeyFormat,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            claim_ttl: Duration::from_secs(60),
            in_flight_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            store_timeout: Duration::from_secs(5),
            on_store_failure: FailureMode::FailClosed,
            key_format: KeyFormat::default(),
        }
    }
}

fn env_duration(name: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(unit)
        .filter(|d: &Duration| !d.is_zero())
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl: env_duration("IDEMPOTENCY_TTL_SECS", Duration::from_secs).unwrap_or(defaults.ttl),
            claim_ttl: env_duration("IDEMPOTENCY_CLAIM_TTL_SECS", Duration::from_secs)
                .unwrap_or(defaults.claim_ttl),
            in_flight_wait: std::env::var("IDEMPOTENCY_IN_FLIGHT_WAIT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.in_flight_wait),
            poll_interval: env_duration("IDEMPOTENCY_POLL_INTERVAL_MS", Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            store_timeout: env_duration("IDEMPOTENCY_STORE_TIMEOUT_MS", Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            on_store_failure: std::env::var("IDEMPOTENCY_FAIL_OPEN")
                .map(|v| v == "true" || v == "1")
                .map(|open| FailureMode::from_fail_closed(!open))
                .unwrap_or(defaults.on_store_failure),
            key_format: std::env::var("IDEMPOTENCY_REQUIRE_UUID")
                .ok()
                .filter(|v| v == "true" || v == "1")
                .map(|_| KeyFormat::UuidV4)
                .unwrap_or(defaults.key_format),
        }
    }
}

/// How a coordinated request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler ran and its response is now the canonical record.
    Stored(CapturedResponse),
    /// The handler was not run; this is the previously stored response.
    Replayed(CapturedResponse),
    /// The store was unavailable and the request ran without deduplication.
    Unprotected(CapturedResponse),
}

impl Outcome {
    pub fn response(&self) -> &CapturedResponse {
        match self {
            Outcome::Stored(r) | Outcome::Replayed(r) | Outcome::Unprotected(r) => r,
        }
    }

    pub fn into_response(self) -> CapturedResponse {
        match self {
            Outcome::Stored(r) | Outcome::Replayed(r) | Outcome::Unprotected(r) => r,
        }
    }
}

/// Idempotency errors surfaced to the HTTP layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("{0}")]
    InvalidKey(String),

    #[error("Idempotency key {key} was already used for a different request")]
    Conflict { key: String },

    #[error("A request with idempotency key {key} is still in progress")]
    InProgress { key: String },

    #[error("Idempotency store unavailable: {0}")]
    Unavailable(StoreError),
}

impl From<DomainError> for IdempotencyError {
    fn from(err: DomainError) -> Self {
        IdempotencyError::InvalidKey(err.to_string())
    }
}

/// Orchestrates claim-and-run or replay for keyed requests.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Answer a request carrying `key`, invoking `handler` at most once.
    ///
    /// The handler only runs after this call has won the atomic insert of a
    /// pending claim. A duplicate arriving while the claim is pending polls
    /// until the record completes, and fails with
    /// [`IdempotencyError::InProgress`] once `in_flight_wait` has passed.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        handler: F,
    ) -> Result<Outcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapturedResponse>,
    {
        self.config.key_format.validate(key)?;

        let give_up_at = Instant::now() + self.config.in_flight_wait;
        let mut contended = false;
        loop {
            match self.lookup(key).await {
                Ok(Some(record)) => {
                    if let Some(outcome) = self.resolve_existing(key, fingerprint, &record)? {
                        return Ok(outcome);
                    }
                    self.wait_in_flight(key, give_up_at).await?;
                    continue;
                }
                Ok(None) if contended => self.wait_in_flight(key, give_up_at).await?,
                Ok(None) => {}
                Err(err) => return self.run_unprotected(key, err, handler).await,
            }

            let claim = IdempotencyRecord::pending(key, fingerprint.as_str(), self.config.claim_ttl);
            match with_deadline(self.config.store_timeout, self.store.store(claim)).await {
                Ok(()) => break,
                // Another request claimed the key first.
                Err(StoreError::AlreadyExists(_)) => contended = true,
                Err(err) => return self.run_unprotected(key, err, handler).await,
            }
        }

        let response = handler().await;
        let record = IdempotencyRecord::new(
            key,
            fingerprint.as_str(),
            response.clone(),
            self.config.ttl,
        );

        match with_deadline(self.config.store_timeout, self.store.complete(record)).await {
            Ok(()) => {
                tracing::debug!(key = %key, status = response.status, "Idempotent response stored");
                Ok(Outcome::Stored(response))
            }
            Err(err) => self.persist_failed(key, err, response),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let record = with_deadline(self.config.store_timeout, self.store.get(key)).await?;
        // Never resurrect an expired record, whatever the store returned.
        Ok(record.filter(|r| !r.is_expired()))
    }

    /// Replay or reject against a live record. `None` means the record is a
    /// pending claim for this same request.
    fn resolve_existing(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        record: &IdempotencyRecord,
    ) -> Result<Option<Outcome>, IdempotencyError> {
        if record.request_hash != fingerprint.as_str() {
            tracing::warn!(key = %key, "Idempotency key reused with a different request");
            return Err(IdempotencyError::Conflict {
                key: key.to_string(),
            });
        }
        if record.is_pending() {
            return Ok(None);
        }

        tracing::info!(key = %key, status = record.status_code, "Replaying stored response");
        Ok(Some(Outcome::Replayed(record.response())))
    }

    async fn wait_in_flight(&self, key: &str, give_up_at: Instant) -> Result<(), IdempotencyError> {
        if Instant::now() >= give_up_at {
            tracing::info!(key = %key, "Idempotent request still in flight");
            return Err(IdempotencyError::InProgress {
                key: key.to_string(),
            });
        }
        tokio::time::sleep(self.config.poll_interval).await;
        Ok(())
    }

    async fn run_unprotected<F, Fut>(
        &self,
        key: &str,
        err: StoreError,
        handler: F,
    ) -> Result<Outcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapturedResponse>,
    {
        match self.config.on_store_failure {
            FailureMode::FailClosed => {
                tracing::error!(key = %key, error = %err, "Idempotency store failed, rejecting request");
                Err(IdempotencyError::Unavailable(err))
            }
            FailureMode::FailOpen => {
                tracing::warn!(key = %key, error = %err, "Idempotency store failed, running without protection");
                Ok(Outcome::Unprotected(handler().await))
            }
        }
    }

    fn persist_failed(
        &self,
        key: &str,
        err: StoreError,
        response: CapturedResponse,
    ) -> Result<Outcome, IdempotencyError> {
        if let StoreError::AlreadyExists(_) = err {
            tracing::warn!(key = %key, "Claim lapsed before the handler finished");
        }
        match self.config.on_store_failure {
            FailureMode::FailClosed => {
                tracing::error!(key = %key, error = %err, "Failed to persist idempotent response");
                Err(IdempotencyError::Unavailable(err))
            }
            FailureMode::FailOpen => {
                tracing::warn!(key = %key, error = %err, "Failed to persist idempotent response, returning it unprotected");
                Ok(Outcome::Unprotected(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Minimal store double; only what the coordinator needs.
    #[derive(Default)]
    struct MapStore {
        records: Mutex<HashMap<String, IdempotencyRecord>>,
        fail_get: bool,
        fail_store: bool,
        fail_complete: bool,
        hang: bool,
    }

    #[async_trait]
    impl IdempotencyStore for MapStore {
        async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_get {
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            Ok(self.records.lock().unwrap().get(key).cloned())
        }

        async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
            if self.fail_store {
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            let mut records = self.records.lock().unwrap();
            match records.get(&record.key) {
                Some(existing) if !existing.is_expired() => {
                    Err(StoreError::AlreadyExists(record.key.clone()))
                }
                _ => {
                    records.insert(record.key.clone(), record);
                    Ok(())
                }
            }
        }

        async fn complete(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
            if self.fail_complete {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            let mut records = self.records.lock().unwrap();
            match records.get(&record.key) {
                Some(existing) if !existing.is_expired() && !existing.is_pending() => {
                    Err(StoreError::AlreadyExists(record.key.clone()))
                }
                _ => {
                    records.insert(record.key.clone(), record);
                    Ok(())
                }
            }
        }

        async fn delete_expired(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn coordinator(store: Arc<MapStore>) -> IdempotencyCoordinator {
        IdempotencyCoordinator::new(store, IdempotencyConfig::default())
    }

    fn created(body: &str) -> CapturedResponse {
        CapturedResponse::new(201)
            .with_header("content-type", "application/json")
            .with_body(body.as_bytes().to_vec())
    }

    async fn must_not_run() -> CapturedResponse {
        panic!("handler must not run")
    }

    #[tokio::test]
    async fn test_store_then_replay_then_conflict() {
        let store = Arc::new(MapStore::default());
        let coordinator = coordinator(store.clone());
        let calls = AtomicUsize::new(0);

        let first = RequestFingerprint::compute("POST", "/orders", br#"{"x":1}"#);
        let outcome = coordinator
            .execute("abc", &first, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                created(r#"{"id":1}"#)
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Stored(created(r#"{"id":1}"#)));

        let outcome = coordinator
            .execute("abc", &first, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                created(r#"{"id":2}"#)
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Replayed(created(r#"{"id":1}"#)));

        let second = RequestFingerprint::compute("POST", "/orders", br#"{"x":2}"#);
        let err = coordinator
            .execute("abc", &second, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                created(r#"{"id":3}"#)
            })
            .await
            .unwrap_err();
        assert_eq!(err, IdempotencyError::Conflict { key: "abc".to_string() });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.records.lock().unwrap().get("abc").cloned().unwrap();
        assert_eq!(stored.request_hash, first.as_str());
        assert_eq!(stored.response_body, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_expired_record_is_treated_as_unseen() {
        let store = Arc::new(MapStore::default());
        let fingerprint = RequestFingerprint::compute("POST", "/orders", b"{}");
        let mut stale = IdempotencyRecord::new("k1", fingerprint.as_str(), created("old"), Duration::from_secs(60));
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.records.lock().unwrap().insert("k1".to_string(), stale);

        let outcome = coordinator(store.clone())
            .execute("k1", &fingerprint, || async { created("new") })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Stored(created("new")));
        assert_eq!(store.records.lock().unwrap()["k1"].response_body, b"new".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_waits_for_in_flight_request_then_replays() {
        let store = Arc::new(MapStore::default());
        let coordinator = coordinator(store.clone());
        let fingerprint = RequestFingerprint::compute("POST", "/orders", b"{}");

        // Another process holds the claim and completes it shortly.
        let claim = IdempotencyRecord::pending("race", fingerprint.as_str(), Duration::from_secs(60));
        store.store(claim).await.unwrap();
        let finisher = {
            let store = store.clone();
            let winner = IdempotencyRecord::new(
                "race",
                fingerprint.as_str(),
                created("winner"),
                Duration::from_secs(60),
            );
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                store.complete(winner).await.unwrap();
            })
        };

        let outcome = coordinator
            .execute("race", &fingerprint, must_not_run)
            .await
            .unwrap();
        finisher.await.unwrap();

        assert_eq!(outcome, Outcome::Replayed(created("winner")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_gives_up_on_stuck_claim() {
        let store = Arc::new(MapStore::default());
        let coordinator = coordinator(store.clone());
        let fingerprint = RequestFingerprint::compute("POST", "/orders", b"{}");
        let claim = IdempotencyRecord::pending("stuck", fingerprint.as_str(), Duration::from_secs(60));
        store.store(claim).await.unwrap();

        let started = Instant::now();
        let err = coordinator
            .execute("stuck", &fingerprint, must_not_run)
            .await
            .unwrap_err();

        assert_eq!(err, IdempotencyError::InProgress { key: "stuck".to_string() });
        assert!(started.elapsed() >= IdempotencyConfig::default().in_flight_wait);
    }

    #[tokio::test]
    async fn test_pending_claim_with_other_request_conflicts() {
        let store = Arc::new(MapStore::default());
        let claim = IdempotencyRecord::pending("k", "some-other-hash", Duration::from_secs(60));
        store.store(claim).await.unwrap();
        let fingerprint = RequestFingerprint::compute("POST", "/orders", b"{}");

        let err = coordinator(store)
            .execute("k", &fingerprint, must_not_run)
            .await
            .unwrap_err();
        assert_eq!(err, IdempotencyError::Conflict { key: "k".to_string() });
    }

    #[tokio::test]
    async fn test_lapsed_claim_is_taken_over() {
        let store = Arc::new(MapStore::default());
        let fingerprint = RequestFingerprint::compute("POST", "/orders", b"{}");
        let mut claim = IdempotencyRecord::pending("k", fingerprint.as_str(), Duration::from_secs(60));
        claim.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.records.lock().unwrap().insert("k".to_string(), claim);

        let outcome = coordinator(store.clone())
            .execute("k", &fingerprint, || async { created("fresh") })
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Stored(created("fresh")));
        assert!(!store.records.lock().unwrap()["k"].is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicates_run_handler_once() {
        let store = Arc::new(MapStore::default());
        let coordinator = coordinator(store.clone());
        let fingerprint = RequestFingerprint::compute("POST", "/pay", b"{}");
        let calls = AtomicUsize::new(0);

        let run = |body: &'static str| {
            let coordinator = &coordinator;
            let fingerprint = &fingerprint;
            let calls = &calls;
            async move {
                coordinator
                    .execute("dup", fingerprint, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(75)).await;
                        created(body)
                    })
                    .await
                    .unwrap()
            }
        };

        let (a, b) = tokio::join!(run("a"), run("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = [&a, &b].iter().filter(|o| matches!(o, Outcome::Stored(_))).count();
        let replayed = [&a, &b].iter().filter(|o| matches!(o, Outcome::Replayed(_))).count();
        assert_eq!((stored, replayed), (1, 1));
        assert_eq!(a.response(), b.response());
    }

    #[tokio::test]
    async fn test_complete_failure_after_handler_fails_closed() {
        let store = Arc::new(MapStore {
            fail_complete: true,
            ..Default::default()
        });
        let calls = AtomicUsize::new(0);
        let fingerprint = RequestFingerprint::compute("POST", "/", b"");

        let err = coordinator(store.clone())
            .execute("k", &fingerprint, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                created("live")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IdempotencyError::Unavailable(StoreError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The claim stays behind until it lapses.
        assert!(store.records.lock().unwrap()["k"].is_pending());
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_before_handler() {
        let store = Arc::new(MapStore::default());
        let coordinator = IdempotencyCoordinator::new(
            store,
            IdempotencyConfig {
                key_format: KeyFormat::UuidV4,
                ..Default::default()
            },
        );
        let fingerprint = RequestFingerprint::compute("POST", "/", b"");

        let err = coordinator
            .execute("abc", &fingerprint, must_not_run)
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_closed_by_default() {
        let store = Arc::new(MapStore {
            fail_get: true,
            ..Default::default()
        });
        let fingerprint = RequestFingerprint::compute("POST", "/", b"");

        let err = coordinator(store)
            .execute("k", &fingerprint, must_not_run)
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Unavailable(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_open() {
        let store = Arc::new(MapStore {
            fail_store: true,
            ..Default::default()
        });
        let coordinator = IdempotencyCoordinator::new(
            store,
            IdempotencyConfig {
                on_store_failure: FailureMode::FailOpen,
                ..Default::default()
            },
        );
        let fingerprint = RequestFingerprint::compute("POST", "/", b"");

        let outcome = coordinator
            .execute("k", &fingerprint, || async { created("live") })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Unprotected(created("live")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_surfaces_as_timeout() {
        let store = Arc::new(MapStore {
            hang: true,
            ..Default::default()
        });
        let coordinator = IdempotencyCoordinator::new(
            store,
            IdempotencyConfig {
                store_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let fingerprint = RequestFingerprint::compute("POST", "/", b"");

        let err = coordinator
            .execute("k", &fingerprint, || async { created("live") })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IdempotencyError::Unavailable(StoreError::Timeout(Duration::from_millis(100)))
        );
    }
}
