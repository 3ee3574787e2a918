//! # Tollgate Core
//!
//! The domain layer of Tollgate: admission-control and idempotency primitives.
//! This crate holds the domain types, the ports that infrastructure implements,
//! and the framework-neutral idempotency coordinator. It has no HTTP or database
//! dependencies.

pub mod domain;
pub mod error;
pub mod ports;
pub mod services;

pub use error::DomainError;
