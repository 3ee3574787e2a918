//! Idempotency record stores and the expiry cleaner.

mod cleaner;
mod memory;

pub use cleaner::{CleanerConfig, CleanerError, CleanerHandle, CleanerStats, IdempotencyCleaner};
pub use memory::InMemoryIdempotencyStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisIdempotencyStore};
