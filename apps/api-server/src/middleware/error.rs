//! Error handling - every rejection becomes an `ErrorResponse` body.

use actix_web::{HttpMessage, HttpRequest, HttpResponse, ResponseError, http::StatusCode};
use std::fmt;
use tollgate_core::services::IdempotencyError;
use tollgate_shared::ErrorResponse;

use crate::observability::RequestId;

/// Application-level error type rendered as a JSON `ErrorResponse`.
#[derive(Debug)]
pub enum AppError {
    RateLimited { retry_after: u64 },
    RateLimitUnavailable,
    IdempotencyConflict(String),
    IdempotencyInProgress(String),
    InvalidIdempotencyKey(String),
    IdempotencyUnavailable(String),
    BadRequest(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::RateLimited { retry_after } => {
                write!(f, "Rate limited, retry after {}s", retry_after)
            }
            AppError::RateLimitUnavailable => write!(f, "Rate limiter unavailable"),
            AppError::IdempotencyConflict(key) => write!(f, "Idempotency conflict: {}", key),
            AppError::IdempotencyInProgress(key) => {
                write!(f, "Idempotent request in progress: {}", key)
            }
            AppError::InvalidIdempotencyKey(msg) => write!(f, "Invalid idempotency key: {}", msg),
            AppError::IdempotencyUnavailable(msg) => {
                write!(f, "Idempotency store unavailable: {}", msg)
            }
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl AppError {
    /// Body for this error, tagged with the request ID when known.
    pub fn to_body(&self, request_id: Option<&str>) -> ErrorResponse {
        let error = match self {
            AppError::RateLimited { retry_after } => ErrorResponse::rate_limited(*retry_after),
            AppError::RateLimitUnavailable => ErrorResponse::rate_limit_unavailable(),
            AppError::IdempotencyConflict(key) => ErrorResponse::idempotency_conflict(key),
            AppError::IdempotencyInProgress(key) => ErrorResponse::idempotency_in_progress(key),
            AppError::InvalidIdempotencyKey(detail) => {
                ErrorResponse::idempotency_key_invalid(detail.clone())
            }
            AppError::IdempotencyUnavailable(_) => ErrorResponse::idempotency_unavailable(),
            AppError::BadRequest(detail) => ErrorResponse::bad_request(detail.clone()),
            AppError::Internal(detail) => {
                // Log internal errors
                tracing::error!("Internal error: {}", detail);
                ErrorResponse::internal_error()
            }
        };

        match request_id {
            Some(id) => error.with_request_id(id),
            None => error,
        }
    }

    /// Full HTTP response, headers included.
    pub fn to_response(&self, request_id: Option<&str>) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            AppError::RateLimited { retry_after } => {
                builder
                    .insert_header(("Retry-After", retry_after.to_string()))
                    .insert_header(("X-RateLimit-Remaining", "0"));
            }
            AppError::IdempotencyInProgress(_) => {
                builder.insert_header(("Retry-After", "1"));
            }
            _ => {}
        }
        builder.json(self.to_body(request_id))
    }

    /// Response for `req`, carrying its request ID.
    pub fn response_for(&self, req: &HttpRequest) -> HttpResponse {
        let request_id = req.extensions().get::<RequestId>().cloned();
        self.to_response(request_id.as_ref().map(RequestId::as_str))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::RateLimitUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::IdempotencyConflict(_) => StatusCode::CONFLICT,
            AppError::IdempotencyInProgress(_) => StatusCode::CONFLICT,
            AppError::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,
            AppError::IdempotencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        self.to_response(None)
    }
}

// Conversion from coordinator errors
impl From<IdempotencyError> for AppError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::InvalidKey(msg) => AppError::InvalidIdempotencyKey(msg),
            IdempotencyError::Conflict { key } => AppError::IdempotencyConflict(key),
            IdempotencyError::InProgress { key } => AppError::IdempotencyInProgress(key),
            IdempotencyError::Unavailable(e) => AppError::IdempotencyUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use tollgate_core::ports::StoreError;

    #[actix_web::test]
    async fn test_rate_limited_response_carries_headers() {
        let response = AppError::RateLimited { retry_after: 7 }.to_response(Some("req-1"));

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "7");
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");

        let body = to_bytes(response.into_body()).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.request_id.as_deref(), Some("req-1"));
    }

    #[actix_web::test]
    async fn test_in_progress_asks_client_to_retry() {
        let response = AppError::IdempotencyInProgress("abc".into()).to_response(None);

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
        let body = to_bytes(response.into_body()).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.code, "IDEMPOTENCY_IN_PROGRESS");
    }

    #[test]
    fn test_coordinator_errors_map_to_status() {
        let cases = [
            (
                IdempotencyError::Conflict { key: "k".into() },
                StatusCode::CONFLICT,
            ),
            (
                IdempotencyError::InProgress { key: "k".into() },
                StatusCode::CONFLICT,
            ),
            (
                IdempotencyError::InvalidKey("empty".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                IdempotencyError::Unavailable(StoreError::Backend("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }
}
