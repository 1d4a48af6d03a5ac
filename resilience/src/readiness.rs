//! Two-stage "wait until truly ready" protocol.
//!
//! A freshly started cluster engine answers its informational endpoint well
//! before it has converged on shared state. Readiness is therefore probed in
//! two stages, each under its own retry budget:
//!
//! 1. `primary`: the service responds at all
//! 2. `secondary`: a structural invariant holds (e.g. volumes are listed)
//!
//! Both stages use [`Classifier::readiness`], which also treats "not found yet"
//! and empty listings as transient.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};
use crate::retry::{Classifier, RetryPolicy};

/// Poll interval used by [`wait_until_ready`].
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(2);

/// The probes a service exposes to the readiness protocol.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Cheap liveness probe, e.g. an info/ping endpoint.
    async fn primary(&self) -> Result<()>;

    /// Structural probe. Report "not there yet" as
    /// [`ClusterError::EmptyListing`] or a not-found fault so it is retried.
    async fn secondary(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOptions {
    /// Budget per stage. Zero means a single primary probe.
    pub timeout: Duration,
    pub interval: Duration,
}

impl ReadinessOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_READINESS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One attempt per interval that fits in the timeout, never fewer than one.
    pub fn attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let fits = self.timeout.as_nanos() / self.interval.as_nanos();
        u32::try_from(fits).unwrap_or(u32::MAX).max(1)
    }

    fn stage_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.attempts(), self.interval).with_classifier(Classifier::readiness())
    }
}

/// [`wait_until_ready_with`] using [`DEFAULT_READINESS_INTERVAL`].
pub async fn wait_until_ready<C>(
    check: &C,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: ReadinessCheck + ?Sized,
{
    wait_until_ready_with(check, ReadinessOptions::new(timeout), cancel).await
}

/// Block until both probes pass, a probe fails permanently, a stage's budget
/// runs out, or `cancel` fires.
pub async fn wait_until_ready_with<C>(
    check: &C,
    options: ReadinessOptions,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: ReadinessCheck + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(ClusterError::Cancelled);
    }

    if options.timeout.is_zero() {
        tracing::debug!("readiness timeout is zero, probing once");
        return crate::cancel::or_cancel(cancel, check.primary()).await?;
    }

    tracing::debug!(
        attempts = options.attempts(),
        interval_ms = options.interval.as_millis() as u64,
        "waiting for primary readiness"
    );
    options
        .stage_policy()
        .invoke_cancellable(move || check.primary(), cancel)
        .await?;

    tracing::debug!("primary probe passed, waiting for secondary readiness");
    options
        .stage_policy()
        .invoke_cancellable(move || check.secondary(), cancel)
        .await?;

    tracing::info!("service is ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted probe: primary fails `primary_failures` times, secondary
    /// reports an empty listing `empty_polls` times.
    #[derive(Default)]
    struct Scripted {
        primary_failures: u32,
        empty_polls: u32,
        primary_calls: AtomicU32,
        secondary_calls: AtomicU32,
    }

    #[async_trait]
    impl ReadinessCheck for Scripted {
        async fn primary(&self) -> Result<()> {
            let call = self.primary_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.primary_failures {
                Err(ClusterError::Connection("engine starting".to_string()))
            } else {
                Ok(())
            }
        }

        async fn secondary(&self) -> Result<()> {
            let call = self.secondary_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.empty_polls {
                Err(ClusterError::EmptyListing {
                    resource: "volumes".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn attempts_floor_with_minimum_of_one() {
        let opts = |timeout, interval| {
            ReadinessOptions::new(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval))
                .attempts()
        };

        assert_eq!(opts(30, 2), 15);
        assert_eq!(opts(5, 2), 2);
        assert_eq!(opts(1, 2), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_probes_primary_once_without_sleeping() {
        let check = Scripted {
            primary_failures: 10,
            ..Default::default()
        };
        let start = tokio::time::Instant::now();

        let result = wait_until_ready(&check, Duration::ZERO, &CancellationToken::new()).await;

        assert!(matches!(result, Err(ClusterError::Connection(_))));
        assert_eq!(check.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(check.secondary_calls.load(Ordering::SeqCst), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_listing_is_retried_until_populated() {
        let check = Scripted {
            empty_polls: 3,
            ..Default::default()
        };

        let result = wait_until_ready(&check, Duration::from_secs(30), &CancellationToken::new()).await;

        assert!(result.is_ok());
        assert_eq!(check.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(check.secondary_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stages_have_independent_budgets() {
        // Each stage alone fits in 3 attempts; combined they would not.
        let check = Scripted {
            primary_failures: 2,
            empty_polls: 2,
            ..Default::default()
        };
        let options = ReadinessOptions::new(Duration::from_secs(3))
            .with_interval(Duration::from_secs(1));

        let result = wait_until_ready_with(&check, options, &CancellationToken::new()).await;

        assert!(result.is_ok());
        assert_eq!(check.primary_calls.load(Ordering::SeqCst), 3);
        assert_eq!(check.secondary_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_fault() {
        let check = Scripted {
            empty_polls: u32::MAX,
            ..Default::default()
        };
        let options = ReadinessOptions::new(Duration::from_secs(6))
            .with_interval(Duration::from_secs(2));

        let result = wait_until_ready_with(&check, options, &CancellationToken::new()).await;

        match result {
            Err(ClusterError::PolicyExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ClusterError::EmptyListing { .. }));
            }
            other => panic!("expected PolicyExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_exhaustion() {
        let check = Scripted {
            primary_failures: u32::MAX,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let result = wait_until_ready(&check, Duration::from_secs(60), &cancel).await;

        assert!(matches!(result, Err(ClusterError::Cancelled)));
        assert_eq!(check.secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_primary_fault_is_not_retried() {
        struct Unauthorized(AtomicU32);

        #[async_trait]
        impl ReadinessCheck for Unauthorized {
            async fn primary(&self) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Http {
                    status: 401,
                    message: "unauthorized".to_string(),
                })
            }

            async fn secondary(&self) -> Result<()> {
                Ok(())
            }
        }

        let check = Unauthorized(AtomicU32::new(0));

        let result = wait_until_ready(&check, Duration::from_secs(30), &CancellationToken::new()).await;

        assert!(matches!(result, Err(ClusterError::Http { status: 401, .. })));
        assert_eq!(check.0.load(Ordering::SeqCst), 1);
    }
}
