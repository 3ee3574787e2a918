//! Ports - trait definitions for external dependencies.
//! These are the "interfaces" that infrastructure must implement.

mod idempotency;
mod rate_limit;

pub use idempotency::{IdempotencyStore, StoreError, with_deadline};
pub use rate_limit::{RateLimitError, RateLimiter};
