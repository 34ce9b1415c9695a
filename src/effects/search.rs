//! Search projection of post events, and cached search reads.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{DomainEvent, HandlerError};
use crate::cache::{search_key, CacheLayer, TtlClass, SEARCH_PREFIX};
use crate::coordinator::{EffectOutcome, SideEffect};
use crate::events::{PostCreated, PostDeleted, POST_CREATED, POST_DELETED};
use crate::store::{SearchDocument, SearchIndex, StoreError};

/// Maximum documents returned by a search.
pub const SEARCH_LIMIT: usize = 10;

/// Keeps the search index in step with post events.
///
/// Any change to the index drops every cached search result.
pub struct SearchProjection {
    index: Arc<dyn SearchIndex>,
    cache: CacheLayer,
}

impl SearchProjection {
    /// Binding pattern covering both post events.
    pub const BINDING: &'static str = "post.*";

    pub fn new(index: Arc<dyn SearchIndex>, cache: CacheLayer) -> Self {
        Self { index, cache }
    }

    async fn on_created(&self, created: PostCreated) -> Result<u64, HandlerError> {
        self.index
            .upsert(SearchDocument {
                post_id: created.post_id,
                user_id: created.user_id,
                content: created.content,
                created_at: created.created_at,
            })
            .await?;
        Ok(1)
    }

    async fn on_deleted(&self, deleted: PostDeleted) -> Result<u64, HandlerError> {
        let removed = self.index.remove(&deleted.post_id).await?;
        Ok(u64::from(removed))
    }
}

#[async_trait]
impl SideEffect for SearchProjection {
    fn name(&self) -> &str {
        "search-projection"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<EffectOutcome, HandlerError> {
        let changes = match event.routing_key.as_str() {
            POST_CREATED => self.on_created(event.payload_as()?).await?,
            POST_DELETED => self.on_deleted(event.payload_as()?).await?,
            other => {
                debug!(routing_key = %other, "Search projection ignores event");
                return Ok(EffectOutcome::default());
            }
        };

        let dropped = self.cache.invalidate_prefix(SEARCH_PREFIX).await;
        debug!(changes, dropped, "Search projection updated");
        Ok(EffectOutcome::changed(changes))
    }
}

/// Search through the cache: `search:<query>` is served from cache when
/// present, otherwise loaded from the index and cached with the search TTL.
pub async fn cached_search(
    cache: &CacheLayer,
    index: &dyn SearchIndex,
    query: &str,
) -> Result<Vec<SearchDocument>, StoreError> {
    let query = query.trim();
    if query.is_empty() {
        warn!("Empty search query");
        return Ok(Vec::new());
    }
    cache
        .read_through(&search_key(query), TtlClass::Search, || {
            index.search(query, SEARCH_LIMIT)
        })
        .await
}
