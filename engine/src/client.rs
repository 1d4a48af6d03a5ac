use std::time::Duration;

use async_trait::async_trait;
use quay_resilience::{ClusterError, ReadinessCheck, Result, check_status};
use quay_secrets::BearerToken;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::types::{EngineInfo, VolumeList};

pub const DEFAULT_ENGINE_ADDRESS: &str = "http://127.0.0.1:2375";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub address: String,
    pub token: Option<BearerToken>,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ENGINE_ADDRESS.to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineClient {
    client: Client,
    config: EngineConfig,
}

impl EngineClient {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    pub async fn info(&self) -> Result<EngineInfo> {
        self.get_json("info").await
    }

    /// Volume listing; a `null` list reads as empty.
    pub async fn volumes(&self) -> Result<VolumeList> {
        self.get_json("volumes").await
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/{endpoint}", self.config.address.trim_end_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose());
        }

        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ClusterError::format(format!("/{endpoint}"), "engine response", err.to_string())
        })
    }
}

#[async_trait]
impl ReadinessCheck for EngineClient {
    async fn primary(&self) -> Result<()> {
        let info = self.info().await?;
        tracing::debug!(name = %info.name, version = %info.server_version, "engine answered");
        Ok(())
    }

    async fn secondary(&self) -> Result<()> {
        let listing = self.volumes().await?;
        if listing.is_empty() {
            return Err(ClusterError::EmptyListing {
                resource: "volumes".to_string(),
            });
        }
        tracing::debug!(volumes = listing.volumes().len(), "engine volumes listed");
        Ok(())
    }
}
