//! Engine error taxonomy
//!
//! Propagation policy:
//! - Connection and rate-limit errors are recovered locally (retry/backoff)
//!   and only escalate after exhausting attempts.
//! - Trading errors (Api, RiskViolation) are never retried automatically and
//!   always surface to the caller as part of the execution result.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Missing or invalid credentials/configuration. Fatal to that venue's
    /// authenticated features, not to the process.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient connectivity failure, triggers reconnect/backoff.
    #[error("{venue} connection error during {operation}: {message}")]
    Connection {
        venue: String,
        operation: String,
        message: String,
    },

    /// Caller must back off; requests are never queued indefinitely.
    #[error("{venue} rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { venue: String, retry_after_ms: u64 },

    /// Venue rejected the request. Surfaced verbatim, not retried.
    #[error("{venue} API error {code} during {operation}: {message}")]
    Api {
        venue: String,
        operation: String,
        code: i64,
        message: String,
    },

    /// Venue is running in public-data-only mode.
    #[error("{venue}: not authenticated for {operation}")]
    NotAuthenticated { venue: String, operation: String },

    /// Pre-trade check failed; aborts before any network call.
    #[error("risk violation: {0}")]
    RiskViolation(String),

    /// Bad configuration input, rejected synchronously.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn connection(venue: &str, operation: &str, message: impl ToString) -> Self {
        EngineError::Connection {
            venue: venue.to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub fn api(venue: &str, operation: &str, code: i64, message: impl ToString) -> Self {
        EngineError::Api {
            venue: venue.to_string(),
            operation: operation.to_string(),
            code,
            message: message.to_string(),
        }
    }

    pub fn not_authenticated(venue: &str, operation: &str) -> Self {
        EngineError::NotAuthenticated {
            venue: venue.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Transient errors are recovered locally; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Connection { .. } | EngineError::RateLimitExceeded { .. }
        )
    }
}
