//! Resilient-client primitives for cluster tooling.
//!
//! This crate provides:
//! - A single error taxonomy ([`ClusterError`] / [`FaultKind`]) shared by every
//!   cluster client in the workspace
//! - Transient-fault classification that composes by logical OR
//! - Retry strategies (no-retry, linear, exponential) with cancellation
//! - The two-stage readiness protocol used to synchronize with an
//!   eventually-consistent cluster engine

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod cancel;
pub mod error;
pub mod readiness;
pub mod retry;

pub use cancel::{or_cancel, sleep_or_cancel};
pub use error::{ClusterError, FaultKind, Result, check_status};
pub use readiness::{
    DEFAULT_READINESS_INTERVAL, ReadinessCheck, ReadinessOptions, wait_until_ready,
    wait_until_ready_with,
};
pub use retry::{Backoff, Classifier, RetryPolicy};

/// Re-exported so downstream crates share one cancellation type.
pub use tokio_util::sync::CancellationToken;
