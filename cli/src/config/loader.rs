use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use quay_consul::{ConsulConfig, DEFAULT_CONSUL_ADDRESS};
use quay_engine::DEFAULT_ENGINE_ADDRESS;
use quay_kv::WatchOptions;
use quay_resilience::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::config::error::{ConfigError, Result};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuayConfig {
    #[serde(default)]
    pub consul: ConsulSection,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub vault: VaultSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub readiness: ReadinessSection,

    #[serde(default)]
    pub log: LogSection,
}

/// Coordination store connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsulSection {
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// ACL token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Blocking-read wait used by `watch`
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_address")]
    pub address: String,
}

/// Secret store used to obtain the engine bearer token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultSection {
    /// Required only for approle credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<PathBuf>,
}

/// Retry settings for store reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessSection {
    /// Budget per readiness stage; 0 probes once
    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_consul_address() -> String {
    DEFAULT_CONSUL_ADDRESS.to_string()
}
fn default_wait_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_engine_address() -> String {
    DEFAULT_ENGINE_ADDRESS.to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30000
}
fn default_readiness_timeout_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConsulSection {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            token: None,
            wait_secs: default_wait_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            address: default_engine_address(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_readiness_timeout_secs(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl QuayConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, address) in [
            ("consul.address", &self.consul.address),
            ("engine.address", &self.engine.address),
        ] {
            if !(address.starts_with("http://") || address.starts_with("https://")) {
                return Err(ConfigError::ValidationError(format!(
                    "{field} must be an http(s) URL, got '{address}'"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.log.level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "log.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn consul_config(&self) -> ConsulConfig {
        ConsulConfig {
            address: self.consul.address.clone(),
            token: self.consul.token.clone(),
            request_timeout: Duration::from_secs(self.consul.request_timeout_secs),
        }
    }

    /// Exponential policy for one-shot store operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    /// Watches keep the configured delays but never give up on network faults.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            wait_time: Duration::from_secs(self.consul.wait_secs),
            retry: self.retry_policy().unbounded(),
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.timeout_secs)
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (QUAY_ prefix)
    pub fn load(&self) -> Result<QuayConfig> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&QuayConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(ref path) = self.config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }

        // Example: QUAY_CONSUL__ADDRESS=http://consul.service:8500
        builder = builder.add_source(
            Environment::with_prefix("QUAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: QuayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the default config file:
    /// 1. Current directory: ./quay.toml
    /// 2. XDG config: ~/.config/quay/config.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./quay.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("quay").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Load from an explicit path, else the first default location found.
    pub fn load_from(path: Option<&Path>) -> Result<QuayConfig> {
        let loader = match path.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
