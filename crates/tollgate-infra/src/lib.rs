//! # Tollgate Infrastructure
//!
//! Concrete implementations of the ports defined in `tollgate-core`:
//! the in-memory rate limiter and the idempotency record stores.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, in-memory only
//! - `postgres` - PostgreSQL record store via SeaORM
//! - `redis` - Redis record store

pub mod idempotency;
pub mod rate_limit;

#[cfg(feature = "postgres")]
pub mod database;

// Re-exports - In-Memory
pub use idempotency::{
    CleanerConfig, CleanerError, CleanerHandle, CleanerStats, IdempotencyCleaner,
    InMemoryIdempotencyStore,
};
pub use rate_limit::{InMemoryRateLimiter, RateLimitConfig, TokenBucket};

// Re-exports - Durable stores
#[cfg(feature = "postgres")]
pub use database::{DatabaseConfig, PostgresIdempotencyStore};
#[cfg(feature = "redis")]
pub use idempotency::{RedisConfig, RedisIdempotencyStore};
