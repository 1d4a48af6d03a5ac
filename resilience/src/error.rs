//! Error taxonomy for cluster operations
//!
//! Every client in the workspace (coordination store, cluster engine, secret
//! store) reports failures as [`ClusterError`]. [`ClusterError::kind`] projects
//! a value onto the coarse [`FaultKind`] taxonomy so callers can pattern-match
//! on "not found" vs "malformed" vs "gave up" without string inspection.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cluster result type alias
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Coarse classification of a [`ClusterError`].
///
/// `Transient` here is the *base* classification. Whether a particular call
/// site retries is decided by the [`crate::Classifier`] in use, which may widen
/// it (e.g. readiness treats `NotFound` as transient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Network failure, timeout, 5xx/429, or an operation-specific transient
    /// condition such as an empty resource listing.
    Transient,
    /// The key or resource does not exist.
    NotFound,
    /// A value is present but cannot be parsed into the requested type.
    Format,
    /// Aborted by explicit caller cancellation.
    Cancelled,
    /// A retry policy ran out of attempts or time.
    PolicyExhausted,
    /// Any other permanent failure (4xx, configuration, local I/O).
    Fatal,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for '{key}': expected {expected}, {reason}")]
    Format {
        key: String,
        expected: &'static str,
        reason: String,
    },

    #[error("Resource listing '{resource}' is empty")]
    EmptyListing { resource: String },

    #[error("Operation cancelled")]
    Cancelled,

    /// The last underlying fault is available through `source()`.
    #[error("Retry policy exhausted after {attempts} attempt(s) in {elapsed:?}")]
    PolicyExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: Box<ClusterError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ClusterError {
    pub fn not_found(key: impl Into<String>) -> Self {
        ClusterError::NotFound { key: key.into() }
    }

    pub fn format(key: impl Into<String>, expected: &'static str, reason: impl Into<String>) -> Self {
        ClusterError::Format {
            key: key.into(),
            expected,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            ClusterError::Connection(_)
            | ClusterError::Timeout(_)
            | ClusterError::EmptyListing { .. } => FaultKind::Transient,
            ClusterError::Http { status, .. } => match *status {
                404 => FaultKind::NotFound,
                429 | 500..=599 => FaultKind::Transient,
                _ => FaultKind::Fatal,
            },
            ClusterError::NotFound { .. } => FaultKind::NotFound,
            ClusterError::Format { .. } => FaultKind::Format,
            ClusterError::Cancelled => FaultKind::Cancelled,
            ClusterError::PolicyExhausted { .. } => FaultKind::PolicyExhausted,
            ClusterError::Config(_) | ClusterError::Io { .. } | ClusterError::TaskFailed(_) => {
                FaultKind::Fatal
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClusterError::Cancelled)
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClusterError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// For `PolicyExhausted`, the fault that caused the final attempt to fail.
    pub fn last_fault(&self) -> Option<&ClusterError> {
        match self {
            ClusterError::PolicyExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// Pass a successful response through; turn any other status into
/// [`ClusterError::Http`] carrying the trimmed body, or the status reason when
/// the body is empty.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match body.trim() {
        "" => status.canonical_reason().unwrap_or("request failed").to_string(),
        trimmed => trimmed.to_string(),
    };
    Err(ClusterError::Http {
        status: status.as_u16(),
        message,
    })
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ClusterError::Config(err.to_string())
        } else if err.is_timeout() {
            ClusterError::Timeout(err.to_string())
        } else if err.is_connect() {
            ClusterError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            ClusterError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            let key = err.url().map(ToString::to_string).unwrap_or_default();
            ClusterError::format(key, "well-formed response body", err.to_string())
        } else {
            // Body/redirect/upgrade failures are transport level.
            ClusterError::Connection(err.to_string())
        }
    }
}
