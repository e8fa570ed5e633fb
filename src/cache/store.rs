//! Response store abstraction and the in-process implementation.
//!
//! Stores are byte-oriented key/value maps with per-entry TTL. Entries are
//! encoded `CachedResponse` values or learned `Vary` header lists; the store
//! itself never interprets them.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode, response::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use super::error::CacheError;
use super::freshness::MAX_TTL;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_BACKEND_ERROR: &str = "quire_cache_backend_error_total";

/// Key/value store holding cached responses.
///
/// Implementations must treat `delete` of an absent key as a no-op and must be
/// safe to share across tasks; last write wins per key.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`; returns whether an entry was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// Full HTTP response as persisted in a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
}

impl CachedResponse {
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: parts
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CacheError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn into_response(self) -> Response {
        let Ok(status) = StatusCode::from_u16(self.status) else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }

        response
    }
}

mod body_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

// ============================================================================
// In-process store
// ============================================================================

struct MemoryEntry {
    value: Bytes,
    expires_at: Instant,
}

/// LRU-bounded in-process store with per-entry expiry.
///
/// Expired entries are dropped lazily on read.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(MAX_TTL))
            .unwrap_or(now);
        let entry = MemoryEntry { value, expires_at };
        let displaced = mutex_lock(&self.entries, SOURCE, "set").push(key.to_string(), entry);
        if let Some((evicted, _)) = displaced {
            if evicted != key {
                debug!(key = %evicted, "evicted least recently used entry");
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(mutex_lock(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some())
    }
}

// ============================================================================
// Bounded access
// ============================================================================

/// Timeout-bounded, failure-absorbing front for a `ResponseStore`.
///
/// Every error or timeout is logged and reported as a miss (reads) or a
/// skipped write, so the serving path never waits on an unhealthy store.
#[derive(Clone)]
pub struct CacheBackend {
    store: Arc<dyn ResponseStore>,
    op_timeout: Duration,
}

impl CacheBackend {
    pub fn new(store: Arc<dyn ResponseStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    pub fn store(&self) -> &Arc<dyn ResponseStore> {
        &self.store
    }

    pub async fn fetch(&self, key: &str) -> Option<Bytes> {
        match timeout(self.op_timeout, self.store.get(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                self.report("get", key, &err);
                None
            }
            Err(_) => {
                self.report("get", key, &self.timed_out("get"));
                None
            }
        }
    }

    pub async fn fetch_response(&self, key: &str) -> Option<CachedResponse> {
        let raw = self.fetch(key).await?;
        match CachedResponse::decode(&raw) {
            Ok(cached) => Some(cached),
            Err(err) => {
                self.report("decode", key, &err);
                None
            }
        }
    }

    /// Write `value`; returns whether the write completed.
    pub async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        match timeout(self.op_timeout, self.store.set(key, value, ttl)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                self.report("set", key, &err);
                false
            }
            Err(_) => {
                self.report("set", key, &self.timed_out("set"));
                false
            }
        }
    }

    pub async fn put_response(&self, key: &str, response: &CachedResponse, ttl: Duration) -> bool {
        match response.encode() {
            Ok(encoded) => self.put(key, encoded, ttl).await,
            Err(err) => {
                self.report("encode", key, &err);
                false
            }
        }
    }

    /// Evict `key`; absent keys are not an error.
    pub async fn evict(&self, key: &str) -> bool {
        match timeout(self.op_timeout, self.store.delete(key)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(err)) => {
                self.report("delete", key, &err);
                false
            }
            Err(_) => {
                self.report("delete", key, &self.timed_out("delete"));
                false
            }
        }
    }

    fn timed_out(&self, op: &'static str) -> CacheError {
        CacheError::Timeout {
            op,
            timeout_ms: self.op_timeout.as_millis(),
        }
    }

    fn report(&self, op: &'static str, key: &str, err: &CacheError) {
        counter!(METRIC_BACKEND_ERROR, "op" => op).increment(1);
        warn!(
            target = "quire::cache::store",
            op,
            key,
            error = %err,
            "cache backend degraded to miss"
        );
    }
}
