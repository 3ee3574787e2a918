//! Single-key token bucket.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use tollgate_core::domain::Rate;
use tollgate_core::ports::RateLimitError;

/// Slack for float drift when comparing a balance against one permit.
const EPSILON: f64 = 1e-9;

struct BucketState {
    capacity: f64,
    tokens: f64,
    /// `permits` become available every `per_secs`. Kept apart so a full
    /// period refills exactly `permits`, not a rounded quotient.
    permits: f64,
    per_secs: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.permits / self.per_secs).min(self.capacity);
        self.last_refill = now;
    }

    fn has_permit(&self) -> bool {
        self.tokens >= 1.0 - EPSILON
    }
}

/// Token bucket refilled continuously from elapsed monotonic time.
///
/// Starts full. Each admitted request consumes one permit. A bucket whose
/// capacity is below one permit never admits anything.
///
/// All state sits behind one mutex, so concurrent callers can never spend the
/// same permit twice.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket, rejecting zero, negative or non-finite parameters.
    pub fn new(capacity: f64, refill_per_second: f64) -> Result<Self, RateLimitError> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(RateLimitError::InvalidRate(format!(
                "capacity must be a positive number, got {capacity}"
            )));
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(RateLimitError::InvalidRate(format!(
                "refill rate must be a positive number, got {refill_per_second}"
            )));
        }

        let now = Instant::now();
        Ok(Self {
            state: Mutex::new(BucketState {
                capacity,
                tokens: capacity,
                permits: refill_per_second,
                per_secs: 1.0,
                last_refill: now,
                last_seen: now,
            }),
        })
    }

    /// Create a full bucket for an already validated [`Rate`].
    pub fn from_rate(rate: &Rate) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                capacity: rate.capacity(),
                tokens: rate.capacity(),
                permits: rate.permits(),
                per_secs: rate.per().as_secs_f64(),
                last_refill: now,
                last_seen: now,
            }),
        }
    }

    /// Try to consume one permit.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.refill(now);
        state.last_seen = now;

        if state.has_permit() {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Whole seconds until a permit is guaranteed; 0 when one is available now.
    pub fn retry_after(&self) -> u64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());

        if state.has_permit() {
            0
        } else {
            let wait = (1.0 - state.tokens) * state.per_secs / state.permits;
            (wait - EPSILON).ceil().max(1.0) as u64
        }
    }

    /// Switch to a new rate in place.
    ///
    /// Time elapsed so far is credited at the old rate; the balance is then
    /// clamped to the new capacity.
    pub fn reseed(&self, rate: &Rate) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.capacity = rate.capacity();
        state.permits = rate.permits();
        state.per_secs = rate.per().as_secs_f64();
        state.tokens = state.tokens.min(state.capacity);
    }

    /// Current permit balance after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }

    /// Time since the bucket last handled an `allow` call.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_seen)
    }
}
