//! Client for the cluster engine's REST API.
//!
//! Only the two endpoints the readiness protocol needs are modelled:
//! `/info` (liveness) and `/volumes` (converged shared state).

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod client;
mod types;

pub use client::{DEFAULT_ENGINE_ADDRESS, EngineClient, EngineConfig};
pub use types::{EngineInfo, Volume, VolumeList};
