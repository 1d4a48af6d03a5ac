//! Coordination-store abstractions.
//!
//! - [`KvStore`]: the port every coordination store adapter implements
//! - [`MemoryKvStore`]: an in-process store with blocking-read support
//! - [`KvStoreExt`]: typed accessors (string, bool, numbers, JSON)
//! - [`Watcher`]: index-based change detection on a key or prefix

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod memory;
mod store;
mod typed;
mod watch;

pub use memory::{DEFAULT_TOMBSTONE_LIMIT, MemoryKvStore};
pub use store::{KvEntry, KvQuery, KvResponse, KvStore};
pub use typed::{KvStoreExt, parse_bool};
pub use watch::{
    DEFAULT_WATCH_WAIT, WatchEvent, WatchHandle, WatchHandler, WatchOptions, WatchTarget, Watcher,
};
