//! Domain-level error types.

use thiserror::Error;

/// Domain errors - invalid values rejected at construction time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Invalid record state: {0}")]
    InvalidRecordState(String),
}
