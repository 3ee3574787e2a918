//! Caller identity placed in request extensions by an upstream auth layer.

use actix_web::{HttpMessage, dev::ServiceRequest};

/// Authenticated caller ID, used to key rate limits per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The caller ID attached to `req`, if any.
    pub fn from_request(req: &ServiceRequest) -> Option<Self> {
        req.extensions().get::<CallerId>().cloned()
    }
}
