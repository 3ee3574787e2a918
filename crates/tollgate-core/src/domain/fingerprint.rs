use std::fmt;

use sha2::{Digest, Sha256};

/// Deterministic digest of the parts of a request that define what it does.
///
/// Only the method, the path (with query string) and the body are hashed.
/// Each part is length-prefixed so that shifting bytes between parts changes
/// the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn compute(method: &str, path_and_query: &str, body: &[u8]) -> Self {
        let method = method.to_ascii_uppercase();

        let mut hasher = Sha256::new();
        for part in [method.as_bytes(), path_and_query.as_bytes(), body] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RequestFingerprint> for String {
    fn from(fingerprint: RequestFingerprint) -> Self {
        fingerprint.0
    }
}
