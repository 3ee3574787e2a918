//! SeaORM entities.

pub mod idempotency_record;
