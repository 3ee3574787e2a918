use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Framing headers that are recomputed when a response is rebuilt.
const UNCAPTURED_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Snapshot of a handler response, independent of any HTTP framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header, skipping framing headers.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into().to_ascii_lowercase();
        if !UNCAPTURED_HEADERS.contains(&name.as_str()) {
            self.headers.push((name, value.into()));
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// The key is claimed and its handler is running. No response yet.
    Pending,
    /// The handler finished and its response is replayable.
    Completed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(RecordState::Pending),
            "completed" => Ok(RecordState::Completed),
            other => Err(DomainError::InvalidRecordState(other.to_string())),
        }
    }
}

/// A stored outcome for one idempotency key.
///
/// A record starts as a pending claim and is completed exactly once with the
/// handler's response. It stops being visible once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub state: RecordState,
    pub status_code: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Build a completed record for a captured response, expiring after `ttl`.
    pub fn new(
        key: impl Into<String>,
        request_hash: impl Into<String>,
        response: CapturedResponse,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            state: RecordState::Completed,
            status_code: response.status,
            response_headers: response.headers,
            response_body: response.body,
            created_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// Build a claim on `key` for a request about to run. The claim lapses
    /// after `ttl` if it is never completed.
    pub fn pending(key: impl Into<String>, request_hash: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            state: RecordState::Pending,
            status_code: 0,
            response_headers: Vec::new(),
            response_body: Vec::new(),
            created_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == RecordState::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn response(&self) -> CapturedResponse {
        CapturedResponse {
            status: self.status_code,
            headers: self.response_headers.clone(),
            body: self.response_body.clone(),
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Accepted shapes for client-supplied idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Any non-blank visible ASCII string up to `max_len` bytes.
    Any { max_len: usize },
    /// A hyphenated version-4 UUID.
    UuidV4,
}

impl Default for KeyFormat {
    fn default() -> Self {
        KeyFormat::Any { max_len: 255 }
    }
}

impl KeyFormat {
    pub fn validate(&self, key: &str) -> Result<(), DomainError> {
        match self {
            KeyFormat::Any { max_len } => {
                if key.trim().is_empty() {
                    return Err(DomainError::InvalidIdempotencyKey(
                        "key must not be empty".to_string(),
                    ));
                }
                if key.len() > *max_len {
                    return Err(DomainError::InvalidIdempotencyKey(format!(
                        "key must be at most {max_len} bytes"
                    )));
                }
                if !key.bytes().all(|b| b.is_ascii_graphic()) {
                    return Err(DomainError::InvalidIdempotencyKey(
                        "key must contain visible ASCII characters only".to_string(),
                    ));
                }
                Ok(())
            }
            KeyFormat::UuidV4 => match Uuid::try_parse(key) {
                Ok(id) if id.get_version_num() == 4 && key.len() == 36 => Ok(()),
                _ => Err(DomainError::InvalidIdempotencyKey(
                    "key must be a version 4 UUID".to_string(),
                )),
            },
        }
    }
}
