//! Rate limiting port.

use async_trait::async_trait;

use crate::domain::Rate;
use crate::error::DomainError;

/// Rate limiter trait - abstraction over rate limiting backends.
///
/// An `Err` from [`RateLimiter::allow`] means the limiter could not decide.
/// Callers must treat it as a failure of the limiter, never as a deny.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one permit for `key`.
    /// Returns Ok(true) if allowed, Ok(false) if rate limited.
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError>;

    /// Register or replace the rate used for `key`.
    async fn limit(&self, key: &str, rate: Rate) -> Result<(), RateLimitError>;

    /// Whole seconds until `key` is guaranteed a permit; 0 if one is available now.
    async fn retry_after(&self, key: &str) -> u64;
}

/// Rate limit errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<DomainError> for RateLimitError {
    fn from(err: DomainError) -> Self {
        RateLimitError::InvalidRate(err.to_string())
    }
}
