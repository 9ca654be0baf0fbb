//! Expiring key-value store abstraction backing the Token Authority.
//!
//! §3 models the token store as "an opaque expiring map"; §5 requires that
//! `mint`/`revoke` writes and `validate` reads be serialized by the store's
//! own atomic primitives, with no extra locking needed for single-key
//! operations. [`ExpiringStore`] is the trait boundary that lets the token
//! authority (`tokens.rs`) stay store-agnostic; [`InMemoryStore`] is a
//! dependency-free default suitable for a single-process deployment or
//! tests, and [`UpstashStore`] talks to an Upstash Redis REST endpoint the
//! way the teacher's `Kvs` struct in `tinyzkp_api` does (GET/SETEX over
//! HTTPS with bearer auth), generalized here to a trait impl instead of a
//! struct wired directly into the binary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CoreError;

/// An expiring key-value store: `set_ex` writes a value with a TTL, `get`
/// reads it back (or `None` once expired or absent), `delete` removes it
/// unconditionally.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
}

/// A single entry with its absolute expiry instant.
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Dependency-free, single-process expiring store. Reads and writes are
/// serialized by a single mutex; §5 only requires this for multi-key
/// atomicity guarantees the store itself is responsible for, and a mutex
/// around a `HashMap` is the simplest thing that provides it without
/// introducing a false sense of per-key granularity this service doesn't
/// need at its scale.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpiringStore for InMemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::StoreUnavailable("token store lock poisoned".into()))?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::StoreUnavailable("token store lock poisoned".into()))?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CoreError::StoreUnavailable("token store lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Upstash Redis REST client, grounded on the teacher's `Kvs` struct in
/// `tinyzkp_api.rs`: plain HTTPS GET/SETEX/DEL calls with a bearer token,
/// no Redis wire protocol or connection pool to manage.
#[derive(Clone)]
pub struct UpstashStore {
    url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct UpstashResp<T> {
    result: T,
}

impl UpstashStore {
    /// Build from `UPSTASH_REDIS_REST_URL` / `UPSTASH_REDIS_REST_TOKEN`.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut url = std::env::var("UPSTASH_REDIS_REST_URL")
            .map_err(|_| CoreError::StoreUnavailable("UPSTASH_REDIS_REST_URL not set".into()))?;
        if url.ends_with('/') {
            url.pop();
        }
        let token = std::env::var("UPSTASH_REDIS_REST_TOKEN")
            .map_err(|_| CoreError::StoreUnavailable("UPSTASH_REDIS_REST_TOKEN not set".into()))?;
        Ok(Self {
            url,
            token,
            http: reqwest::Client::new(),
        })
    }

    fn auth(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl ExpiringStore for UpstashStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        let url = format!("{}/setex/{}/{}", self.url, key, ttl.as_secs());
        let body = serde_json::to_string(&[value])
            .map_err(|e| CoreError::StoreUnavailable(format!("encode kvs body: {e}")))?;
        let res = self
            .auth(self.http.post(&url))
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("kvs SETEX: {e}")))?;
        if !res.status().is_success() {
            return Err(CoreError::StoreUnavailable(format!(
                "kvs SETEX returned {}",
                res.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let url = format!("{}/get/{}", self.url, key);
        let res = self
            .auth(self.http.get(&url))
            .send()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("kvs GET: {e}")))?;
        if !res.status().is_success() {
            return Err(CoreError::StoreUnavailable(format!(
                "kvs GET returned {}",
                res.status()
            )));
        }
        let text = res
            .text()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("kvs GET body: {e}")))?;
        let parsed: UpstashResp<Option<String>> = serde_json::from_str(&text)
            .map_err(|e| CoreError::StoreUnavailable(format!("kvs GET decode: {e}")))?;
        Ok(parsed.result)
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let url = format!("{}/del/{}", self.url, key);
        let res = self
            .auth(self.http.post(&url))
            .send()
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("kvs DEL: {e}")))?;
        if !res.status().is_success() {
            return Err(CoreError::StoreUnavailable(format!(
                "kvs DEL returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = InMemoryStore::new();
        store.set_ex("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
