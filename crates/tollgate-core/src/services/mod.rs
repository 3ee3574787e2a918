//! Services - logic that runs on top of the ports.

mod idempotency;

pub use idempotency::{IdempotencyConfig, IdempotencyCoordinator, IdempotencyError, Outcome};
