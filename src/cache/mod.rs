//! Read-through cache with TTL classes and prefix invalidation.
//!
//! `CacheLayer` sits in front of a `CacheStore` backend (Redis or in-memory).
//! It never fails a caller because the backend is down: reads degrade to a
//! miss and writes or invalidations degrade to a no-op, each logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use keys::{item_key, listing_key, listing_prefix, search_key, ListingQuery, ResourceKind, SEARCH_PREFIX};
pub use memory::InMemoryCacheStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheStore;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors from a cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TTL out of range: {0:?}")]
    InvalidTtl(Duration),
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for CacheError {
    fn from(err: ::redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// A cached value with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized JSON record.
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(&self.value)
    }
}

/// Key-value backend with per-key expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry. Expired entries are never returned.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store `value` under `key`, replacing any previous value and expiry.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Keys currently stored under `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Freshness class of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Single resources.
    Item,
    /// Paginated listings.
    Listing,
    /// Search results.
    Search,
}

/// TTL per freshness class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub item: Duration,
    pub listing: Duration,
    pub search: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            item: Duration::from_secs(3600),
            listing: Duration::from_secs(300),
            search: Duration::from_secs(120),
        }
    }
}

impl CacheTtls {
    pub fn for_class(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Item => self.item,
            TtlClass::Listing => self.listing,
            TtlClass::Search => self.search,
        }
    }
}

/// Cache facade used by services and the consistency coordinator.
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self { store, ttls }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Live entry for `key`, or `None` on miss or backend failure.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(Some(entry)) if entry.is_live_at(Utc::now()) => {
                debug!(key = %key, "Cache hit");
                Some(entry)
            }
            Ok(_) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cached JSON text, verbatim.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Cached value decoded into `T`. An undecodable value counts as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.get_entry(key).await?;
        match entry.decode() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value does not decode, treating as miss");
                None
            }
        }
    }

    /// Store `value` for `ttl`. Returns whether the write reached the backend.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache value");
                return false;
            }
        };
        self.set_raw(key, encoded, ttl).await
    }

    /// Store already-serialized JSON text for `ttl`.
    pub async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> bool {
        match self.store.set_ex(key, value, ttl).await {
            Ok(()) => {
                debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached value");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed, skipping");
                false
            }
        }
    }

    /// Store `value` with the TTL of `class`.
    pub async fn set_for<T: Serialize + ?Sized>(&self, key: &str, value: &T, class: TtlClass) -> bool {
        self.set(key, value, self.ttls.for_class(class)).await
    }

    /// Delete one key, propagating backend errors.
    pub async fn try_invalidate(&self, key: &str) -> Result<u64> {
        self.store.delete(&[key.to_string()]).await
    }

    /// Delete every key under `prefix`, propagating backend errors.
    pub async fn try_invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let keys = self.store.scan_prefix(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        debug!(prefix = %prefix, removed, "Invalidated cache prefix");
        Ok(removed)
    }

    /// Delete one key. Backend failures are logged and count as zero.
    pub async fn invalidate(&self, key: &str) -> u64 {
        self.try_invalidate(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Cache invalidation failed");
            0
        })
    }

    /// Delete every key under `prefix`. Backend failures are logged and
    /// count as zero.
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        self.try_invalidate_prefix(prefix).await.unwrap_or_else(|e| {
            warn!(prefix = %prefix, error = %e, "Cache prefix invalidation failed");
            0
        })
    }

    /// Return the cached value for `key`, or load it, cache it with the TTL
    /// of `class` and return it.
    ///
    /// Loader errors are returned and nothing is cached.
    pub async fn read_through<T, E, F, Fut>(&self, key: &str, class: TtlClass, load: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = load().await?;
        self.set_for(key, &value, class).await;
        Ok(value)
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("ttls", &self.ttls)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
