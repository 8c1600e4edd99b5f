//! Error kinds and the client-facing rejection envelope.
//!
//! Every component reports failures as a [`FabricError`]. At the external
//! boundary an error is converted into a [`Rejection`], which is the only
//! shape a client ever sees.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry hint for 429 responses.
pub const RETRY_AFTER_TOO_MANY_MS: u64 = 1_000;
/// Default retry hint for 503 responses.
pub const RETRY_AFTER_UNAVAILABLE_MS: u64 = 5_000;

/// Errors the fabric distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricError {
    /// Malformed input. Not retryable.
    BadRequest(String),
    /// Input exceeded the payload cap. Not retryable.
    PayloadTooLarge { size: usize, limit: usize },
    /// A rate-limit tier rejected the request.
    TooManyRequests {
        reason: &'static str,
        retry_after: Option<Duration>,
    },
    /// Circuit open, emergency gate, or load above the admission ceiling.
    Unavailable {
        reason: &'static str,
        retry_after: Option<Duration>,
    },
    /// A deadline expired (quorum wait, edge fetch, compute).
    Timeout(&'static str),
    /// A linearizable read could not be served fresh.
    Stale { key: String },
    /// Unexpected fault. The message is logged, never sent to clients.
    Internal(String),
}

impl FabricError {
    pub fn too_many(reason: &'static str, retry_after: Duration) -> Self {
        Self::TooManyRequests {
            reason,
            retry_after: Some(retry_after),
        }
    }

    pub fn unavailable(reason: &'static str) -> Self {
        Self::Unavailable {
            reason,
            retry_after: None,
        }
    }

    /// HTTP-style status code surfaced to clients.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::TooManyRequests { .. } => 429,
            Self::Unavailable { .. } | Self::Timeout(_) | Self::Stale { .. } => 503,
            Self::Internal(_) => 503,
        }
    }

    /// Stable reason string. Internal details are never included.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::TooManyRequests { reason, .. } => reason,
            Self::Unavailable { reason, .. } => reason,
            Self::Timeout(_) => "timeout",
            Self::Stale { .. } => "stale_read",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn retry_after_ms(&self) -> u64 {
        match self {
            Self::BadRequest(_) | Self::PayloadTooLarge { .. } => 0,
            Self::TooManyRequests { retry_after, .. } => retry_after
                .map(|d| d.as_millis() as u64)
                .unwrap_or(RETRY_AFTER_TOO_MANY_MS),
            Self::Unavailable { retry_after, .. } => retry_after
                .map(|d| d.as_millis() as u64)
                .unwrap_or(RETRY_AFTER_UNAVAILABLE_MS),
            Self::Timeout(_) | Self::Stale { .. } | Self::Internal(_) => {
                RETRY_AFTER_UNAVAILABLE_MS
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::BadRequest(_) | Self::PayloadTooLarge { .. })
    }

    /// Whether a circuit breaker should count this as an endpoint failure.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Internal(_) | Self::Stale { .. })
    }

    pub fn into_rejection(self) -> Rejection {
        Rejection::from(&self)
    }
}

impl std::fmt::Display for FabricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {}", msg),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload too large: {} bytes (limit {})", size, limit)
            }
            Self::TooManyRequests { reason, .. } => write!(f, "too many requests: {}", reason),
            Self::Unavailable { reason, .. } => write!(f, "unavailable: {}", reason),
            Self::Timeout(op) => write!(f, "deadline expired during {}", op),
            Self::Stale { key } => write!(f, "linearizable read of {} could not be served", key),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for FabricError {}

pub type FabricResult<T> = Result<T, FabricError>;

/// Client-facing rejection envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Rejection {
    pub success: bool,
    pub rejected: bool,
    pub reason: String,
    pub code: u16,
    pub retry_after_ms: u64,
    pub timestamp: i64,
}

impl Rejection {
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, 429 | 503)
    }
}

impl From<&FabricError> for Rejection {
    fn from(err: &FabricError) -> Self {
        Self {
            success: false,
            rejected: true,
            reason: err.reason().to_string(),
            code: err.code(),
            retry_after_ms: err.retry_after_ms(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl From<FabricError> for Rejection {
    fn from(err: FabricError) -> Self {
        Rejection::from(&err)
    }
}
