//! In-memory cache store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheError, CacheStore, Result};

/// Process-local cache with lazy expiry.
///
/// `set_unavailable` simulates a backend outage: every operation then fails
/// with `CacheError::Unavailable`.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    unavailable: AtomicBool,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.lock().values().filter(|(_, expires)| *expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("in-memory cache marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.check_available()?;
        let now = Utc::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(CacheEntry {
                key: key.to_string(),
                value: value.clone(),
                expires_at: *expires_at,
            })),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or(CacheError::InvalidTtl(ttl))?;
        self.lock().insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut entries = self.lock();
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|(_, expires_at)| *expires_at > now)
            .count();
        Ok(removed as u64)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let now = Utc::now();
        let mut entries = self.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
