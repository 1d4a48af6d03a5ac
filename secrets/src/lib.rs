//! Credentials for cluster services.
//!
//! A credential blob on disk names either a static token or an approle pair;
//! [`VaultAuth`] turns it into the [`BearerToken`] other clients send.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod credential;
mod vault;

pub use credential::{
    BearerToken, CREDENTIAL_FILE, Credential, default_credential_path, load_credential,
};
pub use vault::{APPROLE_LOGIN_PATH, VaultAuth};
