//! Cache configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheTtls;

/// Cache backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Process-local cache.
    Memory,
    #[default]
    Redis,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Redis connection URL.
    pub url: String,
    pub item_ttl_secs: u64,
    pub listing_ttl_secs: u64,
    pub search_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttls = CacheTtls::default();
        Self {
            cache_type: CacheType::Redis,
            url: "redis://localhost:6379".to_string(),
            item_ttl_secs: ttls.item.as_secs(),
            listing_ttl_secs: ttls.listing.as_secs(),
            search_ttl_secs: ttls.search.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            item: Duration::from_secs(self.item_ttl_secs),
            listing: Duration::from_secs(self.listing_ttl_secs),
            search: Duration::from_secs(self.search_ttl_secs),
        }
    }
}
