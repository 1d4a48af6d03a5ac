//! In-process [`KvStore`] with Consul-style blocking reads.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use quay_resilience::Result;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::store::{KvEntry, KvQuery, KvResponse, KvStore};

/// Tombstones kept before the oldest half is folded into the index floor.
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 4096;

#[derive(Debug, Default)]
struct State {
    index: u64,
    entries: BTreeMap<String, KvEntry>,
    /// Key -> index of the write that deleted it.
    tombstones: BTreeMap<String, u64>,
    /// Highest index among pruned tombstones. Absent keys and all prefixes
    /// report at least this, so indexes never move backwards after pruning.
    floor: u64,
}

impl State {
    fn key_index(&self, key: &str) -> u64 {
        if let Some(entry) = self.entries.get(key) {
            return entry.modify_index;
        }
        self.tombstones.get(key).copied().unwrap_or(0).max(self.floor)
    }

    fn prefix_index(&self, prefix: &str) -> u64 {
        let live = under(&self.entries, prefix)
            .map(|(_, entry)| entry.modify_index)
            .max()
            .unwrap_or(0);
        let deleted = under(&self.tombstones, prefix)
            .map(|(_, index)| *index)
            .max()
            .unwrap_or(0);
        live.max(deleted).max(self.floor)
    }

    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Drop the oldest tombstones once there are more than `limit`, keeping
    /// the newest `limit / 2`.
    fn prune(&mut self, limit: usize) {
        if self.tombstones.len() <= limit {
            return;
        }
        let mut indexes: Vec<u64> = self.tombstones.values().copied().collect();
        indexes.sort_unstable();
        let cutoff = indexes[indexes.len() - limit / 2 - 1];
        self.tombstones.retain(|_, index| *index > cutoff);
        self.floor = self.floor.max(cutoff);
    }
}

fn under<'a, V>(
    map: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a V)> + 'a {
    map.range(prefix.to_string()..)
        .take_while(move |(key, _)| key.starts_with(prefix))
}

/// Thread-safe in-memory coordination store for tests and single-process
/// embedding.
///
/// Every write bumps one global index. A key's reported index is the later of
/// its last write and its deletion; a prefix reports the latest of those under
/// it, so prefix watches observe deletes too.
///
/// Deletions are remembered per key up to a tombstone limit. Past it the
/// oldest are folded into a floor index, and a blocked reader may then wake
/// once without a real change.
#[derive(Debug)]
pub struct MemoryKvStore {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
    tombstone_limit: usize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_tombstone_limit(DEFAULT_TOMBSTONE_LIMIT)
    }

    pub fn with_tombstone_limit(limit: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            changes,
            tombstone_limit: limit,
        }
    }

    /// Current global index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, index: u64) {
        self.changes.send_replace(index);
    }

    async fn read<T, F>(&self, query: KvQuery, project: F) -> Result<KvResponse<T>>
    where
        F: Fn(&State) -> KvResponse<T>,
    {
        // Subscribe before the first projection so no write slips between the
        // check and the wait.
        let mut changes = self.changes.subscribe();
        let deadline = query.wait_time.map(|wait| Instant::now() + wait);

        loop {
            let response = {
                let state = self.lock();
                project(&state)
            };

            let Some(wait_index) = query.wait_index else {
                return Ok(response);
            };
            if response.index > wait_index {
                return Ok(response);
            }

            let changed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, changes.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => return Ok(response),
                    }
                }
                None => changes.changed().await,
            };
            if changed.is_err() {
                return Ok(response);
            }
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str, query: KvQuery) -> Result<KvResponse<Option<KvEntry>>> {
        self.read(query, |state| KvResponse {
            index: state.key_index(key),
            value: state.entries.get(key).cloned(),
        })
        .await
    }

    async fn list(&self, prefix: &str, query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>> {
        self.read(query, |state| KvResponse {
            index: state.prefix_index(prefix),
            value: under(&state.entries, prefix)
                .map(|(_, entry)| entry.clone())
                .collect(),
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let index = {
            let mut state = self.lock();
            let index = state.bump();
            state.tombstones.remove(key);
            state.entries.insert(
                key.to_string(),
                KvEntry {
                    key: key.to_string(),
                    value: value.to_vec(),
                    modify_index: index,
                },
            );
            index
        };
        self.publish(index);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let index = {
            let mut state = self.lock();
            if state.entries.remove(key).is_none() {
                return Ok(());
            }
            let index = state.bump();
            state.tombstones.insert(key.to_string(), index);
            state.prune(self.tombstone_limit);
            index
        };
        self.publish(index);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let index = {
            let mut state = self.lock();
            let doomed: Vec<String> = under(&state.entries, prefix)
                .map(|(key, _)| key.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            let index = state.bump();
            for key in doomed {
                state.entries.remove(&key);
                state.tombstones.insert(key, index);
            }
            state.prune(self.tombstone_limit);
            index
        };
        self.publish(index);
        Ok(())
    }
}
