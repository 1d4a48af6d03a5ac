//! Cancellation-aware waiting.
//!
//! Every suspension point in the workspace (retry sleeps, probe requests, the
//! watch long-poll) races a [`CancellationToken`] through these helpers so an
//! explicit cancel interrupts the wait instead of letting it run to completion.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};

/// Race `future` against `token`.
///
/// Returns `Err(ClusterError::Cancelled)` if the token fires first (or was
/// already cancelled). The losing future is dropped, which aborts any
/// in-flight request it owns.
pub async fn or_cancel<F>(token: &CancellationToken, future: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ClusterError::Cancelled),
        output = future => Ok(output),
    }
}

/// Sleep for `duration` unless `token` fires first.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> Result<()> {
    if token.is_cancelled() {
        return Err(ClusterError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }

    or_cancel(token, tokio::time::sleep(duration)).await
}
