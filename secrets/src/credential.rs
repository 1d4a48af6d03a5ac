//! Credential blob on disk.
//!
//! Default location: ~/.quay/credential.json

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use quay_resilience::{ClusterError, Result};
use serde::{Deserialize, Serialize};

/// Default filename for the credential blob
pub const CREDENTIAL_FILE: &str = "credential.json";

/// What the blob holds: a ready-to-use token or an approle pair to exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Token {
        token: String,
    },
    #[serde(rename = "approle")]
    AppRole {
        role_id: String,
        secret_id: String,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Token { .. } => f.debug_struct("Token").finish_non_exhaustive(),
            Credential::AppRole { role_id, .. } => f
                .debug_struct("AppRole")
                .field("role_id", role_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(****)")
    }
}

/// `~/.quay/credential.json`, if a home directory can be determined.
pub fn default_credential_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quay").join(CREDENTIAL_FILE))
}

/// Read and parse a credential blob.
///
/// A missing file is [`ClusterError::NotFound`]; unparseable content is
/// [`ClusterError::Format`].
pub fn load_credential(path: &Path) -> Result<Credential> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ClusterError::not_found(path.display().to_string()));
        }
        Err(source) => {
            return Err(ClusterError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let credential = serde_json::from_str(&content).map_err(|err| {
        ClusterError::format(path.display().to_string(), "credential document", err.to_string())
    })?;
    tracing::debug!(path = %path.display(), "loaded credential");
    Ok(credential)
}
