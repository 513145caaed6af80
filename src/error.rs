//! Error taxonomy.
//!
//! Every failure a caller can observe carries an [`ErrorKind`] with a stable
//! name and exactly one [`StatusCode`]. Admission kinds (bulkhead, rate limit,
//! open circuit) are terminal and never retried.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::validation::ValidationErrors;
use crate::resilience::rate_limit::RateLimitHeaders;

/// Boxed error produced by a protected operation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("circuit open for '{dependency}', retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// The last failure, annotated with how many attempts were made.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ResilienceError>,
    },

    #[error("deadline of {after:?} exceeded")]
    Timeout { after: Duration },

    #[error("rate limited on '{key}', retry after {retry_after:?}")]
    RateLimited {
        key: String,
        retry_after: Duration,
        headers: RateLimitHeaders,
    },

    #[error("bulkhead full for partition '{partition}'")]
    BulkheadFull { partition: String },

    #[error("bulkhead queue timeout after {waited:?} in partition '{partition}'")]
    BulkheadQueueTimeout { partition: String, waited: Duration },

    #[error("invalid policy: {0}")]
    Validation(ValidationErrors),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("policy '{0}' not found")]
    PolicyNotFound(String),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("operation failed: {0}")]
    Operation(#[source] BoxError),
}

impl ResilienceError {
    /// Wrap an operation's own error.
    pub fn operation(err: impl Into<BoxError>) -> Self {
        ResilienceError::Operation(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            ResilienceError::Timeout { .. } => ErrorKind::Timeout,
            ResilienceError::RateLimited { .. } => ErrorKind::RateLimited,
            ResilienceError::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            ResilienceError::BulkheadQueueTimeout { .. } => ErrorKind::BulkheadQueueTimeout,
            ResilienceError::Validation(_) => ErrorKind::Validation,
            ResilienceError::Configuration(_) => ErrorKind::Configuration,
            ResilienceError::PolicyNotFound(_) => ErrorKind::PolicyNotFound,
            ResilienceError::Cancelled => ErrorKind::Cancelled,
            ResilienceError::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Attempts made before this error surfaced, when retries were involved.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The final underlying failure, looking through the retries-exhausted marker.
    pub fn last_error(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetriesExhausted { last, .. } => last.last_error(),
            other => other,
        }
    }

    /// Suggested wait before trying again, for kinds that know one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_after, .. }
            | ResilienceError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Caller-facing message. Production mode hides diagnostic detail.
    pub fn public_message(&self, production: bool) -> String {
        if !production {
            return self.to_string();
        }
        match self {
            // Field paths and bounds are needed to fix the input and carry no state.
            ResilienceError::Validation(errors) => format!("invalid policy: {}", errors),
            ResilienceError::RateLimited { retry_after, .. } => {
                format!("rate limited, retry after {}ms", retry_after.as_millis())
            }
            other => other.kind().public_message().to_string(),
        }
    }
}

/// Stable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    RetriesExhausted,
    Timeout,
    RateLimited,
    BulkheadFull,
    BulkheadQueueTimeout,
    Validation,
    Configuration,
    PolicyNotFound,
    Cancelled,
    Operation,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::CircuitOpen,
        ErrorKind::RetriesExhausted,
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::BulkheadFull,
        ErrorKind::BulkheadQueueTimeout,
        ErrorKind::Validation,
        ErrorKind::Configuration,
        ErrorKind::PolicyNotFound,
        ErrorKind::Cancelled,
        ErrorKind::Operation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::BulkheadQueueTimeout => "bulkhead_queue_timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::PolicyNotFound => "policy_not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Operation => "operation",
        }
    }

    /// Wire status for this kind. Each kind maps to exactly one code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::CircuitOpen => StatusCode::Unavailable,
            ErrorKind::RetriesExhausted => StatusCode::Unavailable,
            ErrorKind::Timeout => StatusCode::DeadlineExceeded,
            ErrorKind::RateLimited => StatusCode::ResourceExhausted,
            ErrorKind::BulkheadFull => StatusCode::ResourceExhausted,
            ErrorKind::BulkheadQueueTimeout => StatusCode::ResourceExhausted,
            ErrorKind::Validation => StatusCode::InvalidArgument,
            ErrorKind::Configuration => StatusCode::FailedPrecondition,
            ErrorKind::PolicyNotFound => StatusCode::NotFound,
            ErrorKind::Cancelled => StatusCode::Cancelled,
            ErrorKind::Operation => StatusCode::Unknown,
        }
    }

    /// Rejected before reaching the downstream dependency.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ErrorKind::CircuitOpen
                | ErrorKind::RateLimited
                | ErrorKind::BulkheadFull
                | ErrorKind::BulkheadQueueTimeout
        )
    }

    /// The caller should slow down rather than fail hard.
    pub fn should_back_off(&self) -> bool {
        self.is_admission() || matches!(self, ErrorKind::Timeout)
    }

    fn public_message(&self) -> &'static str {
        match self {
            ErrorKind::CircuitOpen => "dependency unavailable",
            ErrorKind::RetriesExhausted => "dependency failed after retries",
            ErrorKind::Timeout => "deadline exceeded",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::BulkheadFull => "too many concurrent requests",
            ErrorKind::BulkheadQueueTimeout => "timed out waiting for capacity",
            ErrorKind::Validation => "invalid policy",
            ErrorKind::Configuration => "invalid configuration",
            ErrorKind::PolicyNotFound => "policy not found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Operation => "dependency error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// gRPC-style status codes used by the wire layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Unavailable = 14,
}
