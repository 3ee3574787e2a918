//! Domain types - rates, idempotency records and request fingerprints.

mod fingerprint;
mod idempotency;
mod policy;
mod rate;

pub use fingerprint::RequestFingerprint;
pub use idempotency::{CapturedResponse, IdempotencyRecord, KeyFormat, RecordState};
pub use policy::FailureMode;
pub use rate::Rate;
