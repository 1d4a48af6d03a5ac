use quay_resilience::{ClusterError, Result, check_status};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::credential::{BearerToken, Credential};

pub const APPROLE_LOGIN_PATH: &str = "/v1/auth/approle/login";

#[derive(Serialize)]
struct LoginRequest<'a> {
    role_id: &'a str,
    secret_id: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

/// Resolves a [`Credential`] into a bearer token against a Vault-compatible
/// secret store.
#[derive(Debug, Clone)]
pub struct VaultAuth {
    client: Client,
    address: String,
}

impl VaultAuth {
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }

    /// Static tokens pass through unchanged; approle pairs are exchanged via
    /// the login endpoint.
    pub async fn token(&self, credential: &Credential) -> Result<BearerToken> {
        match credential {
            Credential::Token { token } => Ok(BearerToken::new(token.clone())),
            Credential::AppRole { role_id, secret_id } => self.login(role_id, secret_id).await,
        }
    }

    async fn login(&self, role_id: &str, secret_id: &str) -> Result<BearerToken> {
        let url = format!("{}{APPROLE_LOGIN_PATH}", self.address.trim_end_matches('/'));
        tracing::debug!(role_id, "exchanging approle credential");

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { role_id, secret_id })
            .send()
            .await?;

        let bytes = check_status(response).await?.bytes().await?;
        let parsed: LoginResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ClusterError::format(&url, "approle login response", err.to_string()))?;
        let auth = parsed
            .auth
            .ok_or_else(|| ClusterError::format(&url, "approle login response", "no auth block"))?;

        tracing::info!(role_id, "approle login succeeded");
        Ok(BearerToken::new(auth.client_token))
    }
}
