//! Redis cache store.
//!
//! Values are JSON strings written with `PSETEX`. The connection is opened
//! lazily on first use so a service starts even while Redis is down; the
//! `ConnectionManager` reconnects on its own afterwards.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CacheEntry, CacheError, CacheStore, Result};

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// Reconnect attempts per operation while Redis is unreachable.
const CONNECT_RETRIES: usize = 2;

/// Bound on connecting and on each response.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis implementation of `CacheStore`.
pub struct RedisCacheStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCacheStore {
    /// Create a store for `url` (e.g., redis://localhost:6379).
    ///
    /// Only parses the URL; no connection is made until the first operation.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(CONNECT_RETRIES)
                    .set_connection_timeout(IO_TIMEOUT)
                    .set_response_timeout(IO_TIMEOUT);
                let conn = ConnectionManager::new_with_config(self.client.clone(), config).await?;
                info!(
                    addr = %self.client.get_connection_info().addr,
                    "Connected to Redis for cache"
                );
                Ok::<_, redis::RedisError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

/// `PSETEX` argument for `ttl`: at least 1ms, at most `i64::MAX` ms.
fn ttl_millis(ttl: Duration) -> Result<u64> {
    u64::try_from(ttl.as_millis())
        .ok()
        .filter(|ms| i64::try_from(*ms).is_ok())
        .map(|ms| ms.max(1))
        .ok_or(CacheError::InvalidTtl(ttl))
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;

        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .get(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };

        // -2: key vanished between GET and PTTL. -1: no expiry set.
        let expires_at = match pttl {
            ms if ms > 0 => Utc::now() + chrono::Duration::milliseconds(ms),
            -1 => chrono::DateTime::<Utc>::MAX_UTC,
            _ => return Ok(None),
        };

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            expires_at,
        }))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let millis = ttl_millis(ttl)?;
        let mut conn = self.connection().await?;
        let _: () = conn.pset_ex(key, value, millis).await?;
        debug!(key = %key, ttl_ms = millis, "Stored cache entry in Redis");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = match_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_pattern_escapes_globs() {
        assert_eq!(match_pattern("posts:"), "posts:*");
        assert_eq!(match_pattern("search:a*b?"), "search:a\\*b\\?*");
        assert_eq!(match_pattern("x[1]"), "x\\[1\\]*");
    }

    #[test]
    fn test_ttl_millis_bounds() {
        assert_eq!(ttl_millis(Duration::from_micros(10)).unwrap(), 1);
        assert_eq!(ttl_millis(Duration::from_secs(120)).unwrap(), 120_000);
        assert!(matches!(
            ttl_millis(Duration::from_secs(u64::MAX)),
            Err(CacheError::InvalidTtl(_))
        ));
    }

    #[test]
    fn test_new_rejects_bad_url() {
        assert!(RedisCacheStore::new("not a url").is_err());
    }
}
