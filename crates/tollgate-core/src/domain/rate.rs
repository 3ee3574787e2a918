use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Refill rate - `permits` become available every `per`.
///
/// The permit count doubles as the bucket capacity, so a rate of
/// "5 per second" allows a burst of 5 and then one request every 200ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    permits: f64,
    per: Duration,
}

impl Rate {
    /// Create a rate, rejecting zero, negative or non-finite values.
    pub fn new(permits: f64, per: Duration) -> Result<Self, DomainError> {
        if !permits.is_finite() || permits <= 0.0 {
            return Err(DomainError::InvalidRate(format!(
                "permits must be a positive number, got {permits}"
            )));
        }
        if per.is_zero() {
            return Err(DomainError::InvalidRate(
                "window must be longer than zero".to_string(),
            ));
        }
        Ok(Self { permits, per })
    }

    pub fn per_second(permits: f64) -> Result<Self, DomainError> {
        Self::new(permits, Duration::from_secs(1))
    }

    pub fn per_minute(permits: f64) -> Result<Self, DomainError> {
        Self::new(permits, Duration::from_secs(60))
    }

    pub fn permits(&self) -> f64 {
        self.permits
    }

    pub fn per(&self) -> Duration {
        self.per
    }

    /// Maximum number of permits a bucket at this rate can hold.
    pub fn capacity(&self) -> f64 {
        self.permits
    }

    pub fn refill_per_second(&self) -> f64 {
        self.permits / self.per.as_secs_f64()
    }
}

impl Default for Rate {
    /// 100 requests per minute.
    fn default() -> Self {
        Self {
            permits: 100.0,
            per: Duration::from_secs(60),
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.permits, self.per.as_secs_f64())
    }
}
