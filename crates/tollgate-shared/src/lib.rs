//! # Tollgate Shared
//!
//! Wire types shared between the server and its clients.

pub mod response;

pub use response::{ErrorResponse, codes};
