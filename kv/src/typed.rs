//! Typed accessors over any [`KvStore`].
//!
//! Values are stored as text: booleans as `true`/`false`, numbers in their
//! decimal form, structured values as JSON. A missing key is always
//! [`ClusterError::NotFound`]; a value that does not parse as the requested
//! type is [`ClusterError::Format`]. Nothing here retries; wrap calls in a
//! `RetryPolicy` where that is wanted.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use quay_resilience::{ClusterError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::{KvQuery, KvStore};

const TRUE_TOKENS: [&str; 3] = ["1", "yes", "true"];
const FALSE_TOKENS: [&str; 3] = ["0", "no", "false"];

/// Parse a stored boolean. Accepts `1/yes/true` and `0/no/false`, ignoring
/// case and surrounding whitespace.
pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    let token = raw.trim();
    if TRUE_TOKENS.iter().any(|t| token.eq_ignore_ascii_case(t)) {
        Ok(true)
    } else if FALSE_TOKENS.iter().any(|t| token.eq_ignore_ascii_case(t)) {
        Ok(false)
    } else {
        Err(ClusterError::format(key, "bool", format!("got {raw:?}")))
    }
}

fn parse_number<T>(key: &str, raw: &str, expected: &'static str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| ClusterError::format(key, expected, format!("got {raw:?}: {err}")))
}

#[async_trait]
pub trait KvStoreExt: KvStore {
    /// Raw bytes of `key`.
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let response = self.get(key, KvQuery::default()).await?;
        response
            .value
            .map(|entry| entry.value)
            .ok_or_else(|| ClusterError::not_found(key))
    }

    async fn get_string(&self, key: &str) -> Result<String> {
        let bytes = self.get_bytes(key).await?;
        String::from_utf8(bytes)
            .map_err(|err| ClusterError::format(key, "UTF-8 string", err.to_string()))
    }

    async fn get_bool(&self, key: &str) -> Result<bool> {
        let raw = self.get_string(key).await?;
        parse_bool(key, &raw)
    }

    async fn get_i32(&self, key: &str) -> Result<i32> {
        let raw = self.get_string(key).await?;
        parse_number(key, &raw, "int")
    }

    async fn get_i64(&self, key: &str) -> Result<i64> {
        let raw = self.get_string(key).await?;
        parse_number(key, &raw, "long")
    }

    async fn get_f64(&self, key: &str) -> Result<f64> {
        let raw = self.get_string(key).await?;
        parse_number(key, &raw, "double")
    }

    /// Decode a JSON value.
    async fn get_object<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.get_bytes(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ClusterError::format(key, "JSON document", err.to_string()))
    }

    async fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value.as_bytes()).await
    }

    async fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.put_string(key, if value { "true" } else { "false" }).await
    }

    async fn put_i32(&self, key: &str, value: i32) -> Result<()> {
        self.put_string(key, &value.to_string()).await
    }

    async fn put_i64(&self, key: &str, value: i64) -> Result<()> {
        self.put_string(key, &value.to_string()).await
    }

    async fn put_f64(&self, key: &str, value: f64) -> Result<()> {
        self.put_string(key, &value.to_string()).await
    }

    /// Encode `value` as JSON.
    async fn put_object<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| ClusterError::format(key, "serializable value", err.to_string()))?;
        self.put(key, &bytes).await
    }

    /// `false` for a missing key; other faults still propagate.
    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self.get(key, KvQuery::default()).await?;
        Ok(response.value.is_some())
    }
}

impl<S> KvStoreExt for S where S: KvStore + ?Sized {}
