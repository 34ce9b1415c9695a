//! In-memory store implementations.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{MediaRepository, Result, SearchDocument, SearchIndex, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Media ids held in memory.
#[derive(Default)]
pub struct InMemoryMediaRepository {
    media: Mutex<BTreeSet<String>>,
    deletes: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let repo = Self::new();
        lock(&repo.media).extend(ids.into_iter().map(Into::into));
        repo
    }

    pub fn insert(&self, id: impl Into<String>) {
        lock(&self.media).insert(id.into());
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.media).contains(id)
    }

    pub fn ids(&self) -> Vec<String> {
        lock(&self.media).iter().cloned().collect()
    }

    /// Number of records actually removed so far.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaRepository for InMemoryMediaRepository {
    async fn delete_media(&self, media_id: &str) -> Result<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("media store marked unavailable".to_string()));
        }
        let removed = lock(&self.media).remove(media_id);
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }
}

/// Substring search over documents held in memory.
#[derive(Default)]
pub struct InMemorySearchIndex {
    docs: Mutex<HashMap<String, SearchDocument>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, post_id: &str) -> Option<SearchDocument> {
        lock(&self.docs).get(post_id).cloned()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, doc: SearchDocument) -> Result<()> {
        lock(&self.docs).insert(doc.post_id.clone(), doc);
        Ok(())
    }

    async fn remove(&self, post_id: &str) -> Result<bool> {
        Ok(lock(&self.docs).remove(post_id).is_some())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>> {
        let needle = query.to_lowercase();
        let mut hits: Vec<SearchDocument> = lock(&self.docs)
            .values()
            .filter(|doc| doc.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.post_id.cmp(&b.post_id)));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn doc(id: &str, content: &str, minute: u32) -> SearchDocument {
        SearchDocument {
            post_id: id.to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delete_media_reports_absence() {
        let repo = InMemoryMediaRepository::with_media(["m1"]);

        assert!(repo.delete_media("m1").await.unwrap());
        assert!(!repo.delete_media("m1").await.unwrap());
        assert_eq!(repo.deletes(), 1);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_newest_first() {
        let index = InMemorySearchIndex::new();
        index.upsert(doc("p1", "Learning Rust", 1)).await.unwrap();
        index.upsert(doc("p2", "rust async", 2)).await.unwrap();
        index.upsert(doc("p3", "gardening", 3)).await.unwrap();

        let hits = index.search("RUST", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|d| d.post_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1"]);

        assert_eq!(index.search("rust", 1).await.unwrap().len(), 1);
    }
}
