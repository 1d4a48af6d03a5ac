//! [`KvStore`](quay_kv::KvStore) adapter for a Consul-compatible coordination
//! store, speaking the `/v1/kv` HTTP API.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod client;

pub use client::{ConsulConfig, ConsulKvStore, DEFAULT_CONSUL_ADDRESS, INDEX_HEADER, TOKEN_HEADER};
