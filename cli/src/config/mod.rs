//! Layered configuration for the `quay` binary.
//!
//! Precedence (later wins): built-in defaults, TOML file, `QUAY_*`
//! environment variables.

pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{
    ConfigLoader, ConsulSection, EngineSection, LogSection, QuayConfig, ReadinessSection,
    RetrySection, VaultSection,
};
