//! Retry logic with pluggable transient-fault classification
//!
//! This module provides:
//! - Transient-fault classification composable by logical OR
//! - Interchangeable strategies: no-retry, linear interval, exponential backoff
//! - Optional jitter and total elapsed timeout
//! - Cancellation support via `CancellationToken`
//!
//! A [`RetryPolicy`] is immutable and holds no per-call state, so one instance
//! can be shared by any number of concurrent callers.

pub mod classifier;
pub mod strategy;

pub use classifier::Classifier;
pub use strategy::{Backoff, RetryPolicy};
