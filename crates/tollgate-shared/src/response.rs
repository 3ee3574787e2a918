//! Standardized API error body.
//!
//! Every rejection carries a stable machine-readable `code` so that clients
//! can branch without parsing `message`.

use serde::{Deserialize, Serialize};

/// Stable error codes.
pub mod codes {
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const RATE_LIMIT_UNAVAILABLE: &str = "RATE_LIMIT_UNAVAILABLE";
    pub const IDEMPOTENCY_CONFLICT: &str = "IDEMPOTENCY_CONFLICT";
    pub const IDEMPOTENCY_IN_PROGRESS: &str = "IDEMPOTENCY_IN_PROGRESS";
    pub const IDEMPOTENCY_KEY_INVALID: &str = "IDEMPOTENCY_KEY_INVALID";
    pub const IDEMPOTENCY_UNAVAILABLE: &str = "IDEMPOTENCY_UNAVAILABLE";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Structured error body: `{code, message, status, request_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code, see [`codes`].
    pub code: String,

    /// A human-readable explanation specific to this occurrence.
    pub message: String,

    /// The HTTP status code.
    pub status: u16,

    /// Request ID for debugging purposes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    // Common error constructors
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            429,
            codes::RATE_LIMITED,
            format!("Rate limit exceeded. Try again in {} seconds.", retry_after_secs),
        )
    }

    pub fn rate_limit_unavailable() -> Self {
        Self::new(
            503,
            codes::RATE_LIMIT_UNAVAILABLE,
            "Rate limiting is temporarily unavailable.",
        )
    }

    pub fn idempotency_conflict(key: &str) -> Self {
        Self::new(
            409,
            codes::IDEMPOTENCY_CONFLICT,
            format!(
                "Idempotency key '{}' was already used for a different request.",
                key
            ),
        )
    }

    pub fn idempotency_in_progress(key: &str) -> Self {
        Self::new(
            409,
            codes::IDEMPOTENCY_IN_PROGRESS,
            format!(
                "A request with idempotency key '{}' is still being processed. Retry shortly.",
                key
            ),
        )
    }

    pub fn idempotency_key_invalid(detail: impl Into<String>) -> Self {
        Self::new(400, codes::IDEMPOTENCY_KEY_INVALID, detail)
    }

    pub fn idempotency_unavailable() -> Self {
        Self::new(
            503,
            codes::IDEMPOTENCY_UNAVAILABLE,
            "Request deduplication is temporarily unavailable. Retry with the same key.",
        )
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, codes::BAD_REQUEST, detail)
    }

    pub fn internal_error() -> Self {
        Self::new(500, codes::INTERNAL_ERROR, "Internal Server Error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_body_shape() {
        let body = serde_json::to_value(ErrorResponse::rate_limited(3)).unwrap();
        assert_eq!(body["code"], "RATE_LIMITED");
        assert_eq!(body["status"], 429);
        assert!(body["message"].as_str().unwrap().contains("3 seconds"));
        assert!(body.get("request_id").is_none());
    }

    #[test]
    fn test_request_id_is_serialized_when_set() {
        let body = serde_json::to_value(ErrorResponse::idempotency_conflict("abc").with_request_id("req-1"))
            .unwrap();
        assert_eq!(body["code"], "IDEMPOTENCY_CONFLICT");
        assert_eq!(body["request_id"], "req-1");
    }
}
