use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quay_resilience::Result;

/// A single key/value pair as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Store index at which this entry was last written.
    pub modify_index: u64,
}

impl KvEntry {
    /// The value as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Read options. The default is a plain, non-blocking read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvQuery {
    /// Block until the target's index moves past this value.
    pub wait_index: Option<u64>,
    /// Upper bound on how long a blocking read may wait.
    pub wait_time: Option<Duration>,
}

impl KvQuery {
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index: Some(wait_index),
            wait_time: Some(wait_time),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.wait_index.is_some()
    }
}

/// A read result tagged with the store's change index for the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse<T> {
    pub index: u64,
    pub value: T,
}

/// Port implemented by every coordination store.
///
/// A missing key is `Ok(None)` (or an empty list), never an error; typed
/// accessors decide whether absence is a fault. Blocking reads return as soon
/// as the target's index exceeds `wait_index`, or with the unchanged index once
/// `wait_time` elapses.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, query: KvQuery) -> Result<KvResponse<Option<KvEntry>>>;

    /// All entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str, query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

#[async_trait]
impl<T> KvStore for Arc<T>
where
    T: KvStore + ?Sized,
{
    async fn get(&self, key: &str, query: KvQuery) -> Result<KvResponse<Option<KvEntry>>> {
        (**self).get(key, query).await
    }

    async fn list(&self, prefix: &str, query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>> {
        (**self).list(prefix, query).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        (**self).delete_prefix(prefix).await
    }
}
