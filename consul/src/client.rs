use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use quay_kv::{KvEntry, KvQuery, KvResponse, KvStore};
use quay_resilience::{ClusterError, Result, check_status};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;

pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";

/// Response header carrying the store's change index.
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Request header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    pub address: String,
    pub token: Option<String>,
    /// Budget for one request, on top of any blocking-read wait.
    pub request_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONSUL_ADDRESS.to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One element of a `GET /v1/kv/...` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEntry {
    key: String,
    /// Base64; `null` for keys holding no value.
    value: Option<String>,
    modify_index: u64,
}

impl RawEntry {
    fn decode(self) -> Result<KvEntry> {
        let value = match self.value {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|err| ClusterError::format(&self.key, "base64 value", err.to_string()))?,
            None => Vec::new(),
        };
        Ok(KvEntry {
            key: self.key,
            value,
            modify_index: self.modify_index,
        })
    }
}

/// HTTP client for the Consul KV API.
#[derive(Debug, Clone)]
pub struct ConsulKvStore {
    client: Client,
    config: ConsulConfig,
    base: Url,
}

impl ConsulKvStore {
    /// Fails with [`ClusterError::Config`] if `config.address` is not an
    /// absolute http(s) URL.
    pub fn new(config: ConsulConfig) -> Result<Self> {
        let base = Url::parse(&config.address).map_err(|err| {
            ClusterError::Config(format!("invalid consul address '{}': {err}", config.address))
        })?;
        if base.cannot_be_a_base() {
            return Err(ClusterError::Config(format!(
                "consul address '{}' cannot carry a path",
                config.address
            )));
        }
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            config,
            base,
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    /// `{address}/v1/kv/{key}` with every `/`-separated segment of `key`
    /// percent-encoded, so `?`, `#` and `%` stay part of the key.
    fn url(&self, key: &str) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ClusterError::Config(format!("consul address '{}' cannot carry a path", self.base))
            })?;
            segments.pop_if_empty().extend(["v1", "kv"]);
            for segment in key.trim_start_matches('/').split('/') {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, key: &str) -> Result<RequestBuilder> {
        let builder = self
            .client
            .request(method, self.url(key)?)
            .timeout(self.config.request_timeout);
        Ok(match &self.config.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        })
    }

    /// GET with optional recursion and blocking-query parameters. A 404 is an
    /// empty result, not an error.
    async fn fetch(
        &self,
        key: &str,
        recurse: bool,
        query: KvQuery,
    ) -> Result<KvResponse<Vec<KvEntry>>> {
        let mut builder = self.request(Method::GET, key)?;
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        if let Some(index) = query.wait_index {
            builder = builder.query(&[("index", index.to_string())]);
        }
        if let Some(wait) = query.wait_time {
            // Consul adds up to wait/16 of jitter to the wait.
            let allowance = self.config.request_timeout + wait + wait / 16;
            builder = builder
                .query(&[("wait", format!("{}s", wait.as_secs().max(1)))])
                .timeout(allowance);
        }

        tracing::debug!(key, recurse, wait_index = ?query.wait_index, "consul kv read");
        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(KvResponse {
                index: read_index(&response)?,
                value: Vec::new(),
            });
        }
        let response = check_status(response).await?;
        let index = read_index(&response)?;

        let raw: Vec<RawEntry> = response.json().await?;
        let mut entries = raw
            .into_iter()
            .map(RawEntry::decode)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(KvResponse {
            index,
            value: entries,
        })
    }

    async fn remove(&self, key: &str, recurse: bool) -> Result<()> {
        let mut builder = self.request(Method::DELETE, key)?;
        if recurse {
            builder = builder.query(&[("recurse", "true")]);
        }
        tracing::debug!(key, recurse, "consul kv delete");
        check_status(builder.send().await?).await?;
        Ok(())
    }
}

fn read_index(response: &Response) -> Result<u64> {
    let Some(raw) = response.headers().get(INDEX_HEADER) else {
        return Ok(0);
    };
    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            ClusterError::format(INDEX_HEADER, "unsigned integer", format!("got {raw:?}"))
        })
}

#[async_trait]
impl KvStore for ConsulKvStore {
    async fn get(&self, key: &str, query: KvQuery) -> Result<KvResponse<Option<KvEntry>>> {
        let response = self.fetch(key, false, query).await?;
        let key = key.trim_start_matches('/');
        Ok(KvResponse {
            index: response.index,
            value: response.value.into_iter().find(|entry| entry.key == key),
        })
    }

    async fn list(&self, prefix: &str, query: KvQuery) -> Result<KvResponse<Vec<KvEntry>>> {
        self.fetch(prefix, true, query).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        tracing::debug!(key, bytes = value.len(), "consul kv put");
        let response = self
            .request(Method::PUT, key)?
            .body(value.to_vec())
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        if body.trim() == "false" {
            return Err(ClusterError::Http {
                status: StatusCode::CONFLICT.as_u16(),
                message: format!("write to '{key}' was rejected"),
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key, false).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.remove(prefix, true).await
    }
}
