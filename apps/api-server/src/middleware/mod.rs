//! Middleware modules.

pub mod error;
pub mod idempotency;
pub mod identity;
pub mod rate_limit;

pub use idempotency::IdempotencyMiddleware;
pub use rate_limit::{RateLimitMiddleware, RateLimitOptions};
