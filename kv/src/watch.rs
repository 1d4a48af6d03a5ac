//! Index-based change detection on a key or prefix.
//!
//! ```text
//! start()
//!   read(target)                      -> handler(change = 1)
//!   spawn:
//!     loop {
//!       read(target, wait_index = last) racing cancel
//!       index >  last -> handler(change += 1); last = index
//!       index == last -> wait timed out, loop
//!       index <  last -> store reset, last = 0
//!     }
//! ```
//!
//! Handler calls for one watch are serialized on its background task, in index
//! order. Separate watches are independent.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quay_resilience::{CancellationToken, Classifier, ClusterError, Result, RetryPolicy};
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::store::{KvEntry, KvQuery, KvResponse, KvStore};

/// Upper bound on a single blocking read.
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn key(key: impl Into<String>) -> Self {
        WatchTarget::Key(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        WatchTarget::Prefix(prefix.into())
    }

    pub fn path(&self) -> &str {
        match self {
            WatchTarget::Key(path) | WatchTarget::Prefix(path) => path,
        }
    }

    async fn read(&self, store: &dyn KvStore, query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>> {
        match self {
            WatchTarget::Key(key) => {
                let response = store.get(key, query).await?;
                Ok(KvResponse {
                    index: response.index,
                    value: response.value.into_iter().collect(),
                })
            }
            WatchTarget::Prefix(prefix) => store.list(prefix, query).await,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Key(key) => write!(f, "key '{key}'"),
            WatchTarget::Prefix(prefix) => write!(f, "prefix '{prefix}'"),
        }
    }
}

/// Snapshot delivered to a [`WatchHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub target: WatchTarget,
    pub index: u64,
    /// Current entries; empty when the key or prefix holds nothing.
    pub entries: Vec<KvEntry>,
    /// 1 for the initial snapshot, then incremented per observed change.
    pub change: u64,
}

impl WatchEvent {
    /// The watched key's entry, for key watches.
    pub fn entry(&self) -> Option<&KvEntry> {
        match self.target {
            WatchTarget::Key(_) => self.entries.first(),
            WatchTarget::Prefix(_) => None,
        }
    }
}

/// Receives watch events. Returning an error stops the watch.
///
/// Implemented for any `FnMut(&WatchEvent) -> Result<()> + Send` closure.
#[async_trait]
pub trait WatchHandler: Send {
    async fn on_change(&mut self, event: &WatchEvent) -> Result<()>;
}

#[async_trait]
impl<F> WatchHandler for F
where
    F: FnMut(&WatchEvent) -> Result<()> + Send,
{
    async fn on_change(&mut self, event: &WatchEvent) -> Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub wait_time: Duration,
    /// Applied to every read. The default retries network faults forever
    /// (1s doubling to 30s); only cancellation or a permanent fault ends it.
    pub retry: RetryPolicy,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            wait_time: DEFAULT_WATCH_WAIT,
            retry: RetryPolicy::exponential(1, Duration::from_secs(1), Duration::from_secs(30))
                .unbounded()
                .with_classifier(Classifier::network()),
        }
    }
}

/// Starts watch sessions against one store.
#[derive(Clone)]
pub struct Watcher {
    store: Arc<dyn KvStore>,
}

impl Watcher {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read `target`, deliver the initial snapshot, then keep watching on a
    /// background task until `cancel` fires or a permanent fault occurs.
    ///
    /// The first handler call has completed by the time this returns. The
    /// session listens on a child of `cancel`, so [`WatchHandle::cancel`] only
    /// stops this watch.
    pub async fn start<H>(
        &self,
        target: WatchTarget,
        mut handler: H,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> Result<WatchHandle>
    where
        H: WatchHandler + 'static,
    {
        let token = cancel.child_token();
        let store = Arc::clone(&self.store);

        let initial = {
            let store = &*store;
            let target = &target;
            options
                .retry
                .invoke_cancellable(move || target.read(store, KvQuery::default()), &token)
                .await?
        };

        let event = WatchEvent {
            target: target.clone(),
            index: initial.index,
            entries: initial.value,
            change: 1,
        };
        handler.on_change(&event).await?;

        let changes = Arc::new(AtomicU64::new(1));
        info!(watch = %target, index = event.index, "watch started");

        let session = Session {
            store,
            target: target.clone(),
            options,
            cancel: token.clone(),
            changes: Arc::clone(&changes),
            last_index: event.index,
        };
        let task = tokio::spawn(session.run(handler));

        Ok(WatchHandle {
            target,
            changes,
            cancel: token.clone(),
            guard: Some(token.drop_guard()),
            task,
        })
    }
}

struct Session {
    store: Arc<dyn KvStore>,
    target: WatchTarget,
    options: WatchOptions,
    cancel: CancellationToken,
    changes: Arc<AtomicU64>,
    last_index: u64,
}

impl Session {
    async fn run<H: WatchHandler>(mut self, mut handler: H) -> Result<()> {
        let result = self.poll(&mut handler).await;
        match &result {
            Err(ClusterError::Cancelled) => {
                info!(
                    watch = %self.target,
                    changes = self.changes.load(Ordering::SeqCst),
                    "watch stopped"
                );
            }
            Err(err) => warn!(watch = %self.target, error = %err, "watch terminated"),
            Ok(()) => {}
        }
        result
    }

    async fn poll<H: WatchHandler>(&mut self, handler: &mut H) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }

            let query = KvQuery::blocking(self.last_index, self.options.wait_time);
            let response = {
                let store = &*self.store;
                let target = &self.target;
                self.options
                    .retry
                    .invoke_cancellable(move || target.read(store, query), &self.cancel)
                    .await?
            };

            if response.index < self.last_index {
                debug!(
                    watch = %self.target,
                    previous = self.last_index,
                    index = response.index,
                    "store index went backwards, resetting"
                );
                self.last_index = 0;
                continue;
            }
            if response.index == self.last_index {
                continue;
            }
            self.last_index = response.index;

            if self.cancel.is_cancelled() {
                return Err(ClusterError::Cancelled);
            }
            let change = self.changes.fetch_add(1, Ordering::SeqCst) + 1;
            info!(watch = %self.target, index = response.index, change, "watch change");

            let event = WatchEvent {
                target: self.target.clone(),
                index: response.index,
                entries: response.value,
                change,
            };
            handler.on_change(&event).await?;
        }
    }
}

/// Handle to a running watch. Dropping it cancels the watch.
pub struct WatchHandle {
    target: WatchTarget,
    changes: Arc<AtomicU64>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
    task: JoinHandle<Result<()>>,
}

impl WatchHandle {
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Handler invocations so far, including the initial snapshot.
    pub fn change_count(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the background task to end and return why it ended:
    /// [`ClusterError::Cancelled`] after cancellation, otherwise the fault that
    /// stopped it.
    pub async fn join(mut self) -> Result<()> {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(ClusterError::TaskFailed(err.to_string())),
            Err(_) => Err(ClusterError::Cancelled),
        }
    }

    /// Cancel and wait for the task to wind down.
    pub async fn stop(self) -> Result<()> {
        self.cancel();
        self.join().await
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("target", &self.target)
            .field("changes", &self.change_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKvStore;
    use crate::typed::KvStoreExt;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn fast_options() -> WatchOptions {
        WatchOptions {
            wait_time: Duration::from_secs(5),
            retry: RetryPolicy::linear(3, Duration::from_millis(100)),
        }
    }

    /// Forwards each event's first value (or `None`) to a channel.
    fn forwarding() -> (
        impl FnMut(&WatchEvent) -> Result<()> + Send + 'static,
        mpsc::UnboundedReceiver<(u64, Option<String>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |event: &WatchEvent| -> Result<()> {
            let value = event
                .entries
                .first()
                .and_then(|entry| entry.value_str().map(str::to_string));
            let _ = tx.send((event.change, value));
            Ok(())
        };
        (handler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn one_callback_per_sequential_write() {
        let store = Arc::new(MemoryKvStore::new());
        store.put_i32("K", 0).await.unwrap();
        let (handler, mut events) = forwarding();

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(handle.change_count(), 1);
        assert_eq!(events.recv().await, Some((1, Some("0".to_string()))));

        for value in 1..=10 {
            store.put_i32("K", value).await.unwrap();
            let (change, seen) = events.recv().await.unwrap();
            assert_eq!(change, u64::try_from(value).unwrap() + 1);
            assert_eq!(seen, Some(value.to_string()));
        }

        assert_eq!(handle.change_count(), 11);
        assert!(matches!(handle.stop().await, Err(ClusterError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_without_change_does_not_fire() {
        let store = Arc::new(MemoryKvStore::new());
        store.put_string("K", "v").await.unwrap();
        let (handler, mut events) = forwarding();

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();
        events.recv().await.unwrap();

        // Several wait windows elapse with only unrelated writes.
        store.put_string("other", "x").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(handle.change_count(), 1);
        assert!(events.try_recv().is_err());
        handle.cancel();
        assert!(matches!(handle.join().await, Err(ClusterError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_callbacks() {
        let store = Arc::new(MemoryKvStore::new());
        store.put_string("K", "0").await.unwrap();
        let (handler, mut events) = forwarding();
        let cancel = CancellationToken::new();

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), cancel.clone())
            .await
            .unwrap();
        events.recv().await.unwrap();

        cancel.cancel();
        let outcome = handle.join().await;
        store.put_string("K", "1").await.unwrap();

        assert!(matches!(outcome, Err(ClusterError::Cancelled)));
        // The handler (and its sender) is gone with the task.
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_watch() {
        let store = Arc::new(MemoryKvStore::new());
        let (handler, mut events) = forwarding();

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some((1, None)));

        drop(handle);

        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_watch_sees_puts_and_deletes() {
        let store = Arc::new(MemoryKvStore::new());
        store.put_string("routes/a", "1").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |event: &WatchEvent| -> Result<()> {
            let keys: Vec<String> = event.entries.iter().map(|e| e.key.clone()).collect();
            let _ = tx.send(keys);
            Ok(())
        };

        let handle = Watcher::new(store.clone())
            .start(
                WatchTarget::prefix("routes/"),
                handler,
                fast_options(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec!["routes/a".to_string()]);

        store.put_string("routes/b", "2").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            vec!["routes/a".to_string(), "routes/b".to_string()]
        );

        store.delete("routes/a").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec!["routes/b".to_string()]);

        assert_eq!(handle.change_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_ends_watch() {
        let store = Arc::new(MemoryKvStore::new());
        store.put_string("K", "0").await.unwrap();
        let handler = |event: &WatchEvent| {
            if event.change > 1 {
                Err(ClusterError::format(event.target.path(), "route", "rejected"))
            } else {
                Ok(())
            }
        };

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();
        store.put_string("K", "1").await.unwrap();

        assert!(matches!(handle.join().await, Err(ClusterError::Format { .. })));
    }

    #[tokio::test]
    async fn initial_handler_error_fails_start() {
        let store = Arc::new(MemoryKvStore::new());
        let handler =
            |_: &WatchEvent| -> Result<()> { Err(ClusterError::Config("no consumer".to_string())) };

        let result = Watcher::new(store)
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ClusterError::Config(_))));
    }

    /// Serves scripted responses and records the wait index of each read.
    struct ScriptedStore {
        responses: Mutex<VecDeque<Result<u64>>>,
        seen: Mutex<Vec<Option<u64>>>,
    }

    impl ScriptedStore {
        fn new(responses: Vec<Result<u64>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KvStore for ScriptedStore {
        async fn get(&self, _key: &str, query: KvQuery) -> Result<KvResponse<Option<KvEntry>>> {
            self.seen.lock().unwrap().push(query.wait_index);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Ok(index)) => Ok(KvResponse { index, value: None }),
                Some(Err(err)) => Err(err),
                None => std::future::pending().await,
            }
        }

        async fn list(&self, _prefix: &str, _query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>> {
            unreachable!("key watch only")
        }

        async fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_prefix(&self, _prefix: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn index_reset_refires_on_next_read() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(5), Ok(5), Ok(3), Ok(4)]));
        let (handler, mut events) = forwarding();

        let handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some((1, None)));
        assert_eq!(events.recv().await, Some((2, None)));
        assert_eq!(handle.change_count(), 2);
        let seen = store.seen.lock().unwrap().clone();
        assert_eq!(&seen[..4], &[None, Some(5), Some(5), Some(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_read_faults_are_retried() {
        let store = Arc::new(ScriptedStore::new(vec![
            Ok(1),
            Err(ClusterError::Connection("reset".to_string())),
            Err(ClusterError::Http {
                status: 503,
                message: "leader election".to_string(),
            }),
            Ok(2),
        ]));
        let (handler, mut events) = forwarding();

        let _handle = Watcher::new(store.clone())
            .start(WatchTarget::key("K"), handler, fast_options(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some((1, None)));
        assert_eq!(events.recv().await, Some((2, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_read_fault_ends_watch() {
        let store = Arc::new(ScriptedStore::new(vec![
            Ok(1),
            Err(ClusterError::Http {
                status: 403,
                message: "ACL not found".to_string(),
            }),
        ]));

        let handle = Watcher::new(store)
            .start(
                WatchTarget::key("K"),
                |_: &WatchEvent| -> Result<()> { Ok(()) },
                fast_options(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(handle.join().await, Err(ClusterError::Http { status: 403, .. })));
    }

    #[test]
    fn default_options_retry_network_faults_forever() {
        let options = WatchOptions::default();

        assert_eq!(options.retry.max_attempts(), None);
        assert_eq!(options.retry.classifier().name(), "network");
        assert_eq!(options.retry.delay_for(10), Duration::from_secs(30));
        assert_eq!(options.wait_time, DEFAULT_WATCH_WAIT);
    }
}
