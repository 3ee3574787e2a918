//! Rate limiting implementations.

mod bucket;
mod memory;

pub use bucket::TokenBucket;
pub use memory::{InMemoryRateLimiter, RateLimitConfig};
