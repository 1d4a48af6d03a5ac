//! Transient-fault classification for retry decisions

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::{ClusterError, FaultKind};

type Predicate = dyn Fn(&ClusterError) -> bool + Send + Sync;

/// Decides whether a [`ClusterError`] is worth retrying.
///
/// Classifiers are pure and cheap to clone. They compose with [`Classifier::or`]
/// so an operation can widen a base detector for its own scope without
/// affecting anyone else who holds the base:
///
/// ```
/// use quay_resilience::Classifier;
///
/// // 404 stays fatal for everyone using `network()`.
/// let startup = Classifier::network().or(Classifier::not_found());
/// ```
#[derive(Clone)]
pub struct Classifier {
    name: Cow<'static, str>,
    predicate: Arc<Predicate>,
}

impl Classifier {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, predicate: F) -> Self
    where
        F: Fn(&ClusterError) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Base detector: connection failures, timeouts, HTTP 5xx and 429.
    pub fn network() -> Self {
        Self::new("network", |err| match err {
            ClusterError::Connection(_) | ClusterError::Timeout(_) => true,
            ClusterError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        })
    }

    /// HTTP 404 and missing keys/resources.
    pub fn not_found() -> Self {
        Self::new("not-found", |err| err.kind() == FaultKind::NotFound)
    }

    /// A resource listing that came back empty.
    pub fn empty_listing() -> Self {
        Self::new("empty-listing", |err| {
            matches!(err, ClusterError::EmptyListing { .. })
        })
    }

    /// Classifies nothing as transient.
    pub fn never() -> Self {
        Self::new("never", |_| false)
    }

    /// Detector used while waiting for an engine to converge after start-up:
    /// network faults, "not found yet", and empty listings are all retried.
    pub fn readiness() -> Self {
        Self::network()
            .or(Self::not_found())
            .or(Self::empty_listing())
    }

    /// Combine two classifiers; the result is transient if either side is.
    pub fn or(self, other: Classifier) -> Self {
        let name = format!("{}|{}", self.name, other.name);
        let left = self.predicate;
        let right = other.predicate;
        Self {
            name: Cow::Owned(name),
            predicate: Arc::new(move |err: &ClusterError| left(err) || right(err)),
        }
    }

    pub fn is_transient(&self, err: &ClusterError) -> bool {
        (self.predicate)(err)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::network()
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier").field("name", &self.name).finish()
    }
}
