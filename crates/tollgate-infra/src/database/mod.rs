//! PostgreSQL persistence for idempotency records.

mod connections;
pub mod entity;
mod postgres_store;

pub use connections::DatabaseConfig;
pub use postgres_store::PostgresIdempotencyStore;
