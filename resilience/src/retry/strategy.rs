//! Retry strategy implementations
//!
//! Three interchangeable variants share one loop:
//! - **No-retry**: invoke once, surface any fault unchanged
//! - **Linear**: fixed interval between attempts
//! - **Exponential**: `min(base * 2^n, ceiling)` with optional jitter
//!
//! ```text
//! attempt = 0
//! loop:
//!     ok  -> return
//!     err -> not transient?            -> return err
//!            attempts/timeout spent?   -> PolicyExhausted { last: err }
//!            sleep(delay_for(attempt)); attempt += 1
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::classifier::Classifier;
use crate::cancel::{or_cancel, sleep_or_cancel};
use crate::error::{ClusterError, Result};

/// Inter-attempt delay schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// No retries at all.
    None,
    /// Fixed delay between attempts.
    Linear { interval: Duration },
    /// `min(base * 2^attempt, ceiling)`, then ±`jitter_factor` randomness.
    Exponential {
        base: Duration,
        ceiling: Duration,
        jitter_factor: f64,
    },
}

impl Backoff {
    /// Delay to sleep after the failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { interval } => interval,
            Backoff::Exponential {
                base,
                ceiling,
                jitter_factor,
            } => {
                let raw = 1_u32
                    .checked_shl(attempt)
                    .and_then(|factor| base.checked_mul(factor))
                    .unwrap_or(ceiling)
                    .min(ceiling);
                if jitter_factor > 0.0 {
                    apply_jitter(raw, jitter_factor).min(ceiling)
                } else {
                    raw
                }
            }
        }
    }
}

/// An immutable retry strategy.
///
/// Holds no attempt counters; each `invoke*` call starts from attempt zero, so
/// a single policy may be shared freely between tasks.
///
/// # Example
/// ```ignore
/// let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(30))
///     .with_classifier(Classifier::network());
///
/// let value = policy.invoke(|| async { store.get_string("proxy/routes").await }).await?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Backoff,
    /// `None` means unbounded (only `timeout` or cancellation can stop it).
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
    classifier: Classifier,
}

enum Decision {
    Stop(ClusterError),
    Retry(Duration),
}

impl RetryPolicy {
    /// Invoke exactly once; any fault propagates as-is.
    pub fn no_retry() -> Self {
        Self {
            backoff: Backoff::None,
            max_attempts: Some(1),
            timeout: None,
            classifier: Classifier::network(),
        }
    }

    /// Up to `max_attempts` calls (at least one), `interval` apart.
    pub fn linear(max_attempts: u32, interval: Duration) -> Self {
        Self {
            backoff: Backoff::Linear { interval },
            max_attempts: Some(max_attempts.max(1)),
            timeout: None,
            classifier: Classifier::network(),
        }
    }

    /// Up to `max_attempts` calls (at least one) with doubling delays capped at
    /// `ceiling`.
    pub fn exponential(max_attempts: u32, base: Duration, ceiling: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential {
                base,
                ceiling,
                jitter_factor: 0.0,
            },
            max_attempts: Some(max_attempts.max(1)),
            timeout: None,
            classifier: Classifier::network(),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Stop retrying once this much time has passed since the first attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Remove the attempt limit. Has no effect on [`RetryPolicy::no_retry`].
    pub fn unbounded(mut self) -> Self {
        if self.backoff != Backoff::None {
            self.max_attempts = None;
        }
        self
    }

    /// ±`factor` randomness on exponential delays (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, factor: f64) -> Self {
        if let Backoff::Exponential { jitter_factor, .. } = &mut self.backoff {
            *jitter_factor = factor.clamp(0.0, 1.0);
        }
        self
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    /// Run `operation` until it succeeds, fails permanently, or the policy is
    /// spent.
    pub async fn invoke<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.decide(attempt, start.elapsed(), err) {
                Decision::Stop(err) => return Err(err),
                Decision::Retry(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Like [`RetryPolicy::invoke`], but both the in-flight attempt and the
    /// inter-attempt sleep are abandoned when `cancel` fires.
    ///
    /// Cancellation surfaces as [`ClusterError::Cancelled`], never as
    /// `PolicyExhausted`.
    pub async fn invoke_cancellable<F, Fut, T>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }

            let err = match or_cancel(cancel, operation()).await? {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.decide(attempt, start.elapsed(), err) {
                Decision::Stop(err) => return Err(err),
                Decision::Retry(delay) => sleep_or_cancel(cancel, delay).await?,
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Synchronous counterpart for non-async operations; sleeps the calling
    /// thread between attempts.
    pub fn invoke_blocking<F, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = std::time::Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.decide(attempt, start.elapsed(), err) {
                Decision::Stop(err) => return Err(err),
                Decision::Retry(delay) => {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    fn decide(&self, attempt: u32, elapsed: Duration, err: ClusterError) -> Decision {
        if self.backoff == Backoff::None
            || err.is_cancelled()
            || !self.classifier.is_transient(&err)
        {
            return Decision::Stop(err);
        }

        let attempts = attempt.saturating_add(1);
        let remaining = self.timeout.map(|timeout| timeout.saturating_sub(elapsed));
        let out_of_attempts = self.max_attempts.is_some_and(|max| attempts >= max);
        let out_of_time = remaining.is_some_and(|left| left.is_zero());

        if out_of_attempts || out_of_time {
            tracing::warn!(
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                classifier = self.classifier.name(),
                error = %err,
                "retry policy exhausted"
            );
            return Decision::Stop(ClusterError::PolicyExhausted {
                attempts,
                elapsed,
                last: Box::new(err),
            });
        }

        let mut delay = self.delay_for(attempt);
        if let Some(left) = remaining {
            delay = delay.min(left);
        }

        tracing::debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient fault, retrying"
        );
        Decision::Retry(delay)
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 100ms doubling to at most 10s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Apply jitter to a duration
///
/// Example: 100ms with 0.5 jitter → 50ms to 150ms
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    duration.mul_f64((1.0 + jitter).max(0.0))
}
