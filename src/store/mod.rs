//! Source-of-truth seams touched by remote-event side effects.
//!
//! Persistence itself belongs to the services; the core only needs to
//! delete media and maintain a search projection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;

pub use memory::{InMemoryMediaRepository, InMemorySearchIndex};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Backend(String),
}

/// Media records owned by the media service.
#[async_trait]
pub trait MediaRepository: Send + Sync {
    /// Delete a media record. Returns `false` if it did not exist.
    async fn delete_media(&self, media_id: &str) -> Result<bool>;
}

/// A post as indexed for search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Search projection owned by the search service.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `doc.post_id`.
    async fn upsert(&self, doc: SearchDocument) -> Result<()>;

    /// Remove the document for `post_id`. Returns `false` if it was absent.
    async fn remove(&self, post_id: &str) -> Result<bool>;

    /// Documents whose content contains `query`, newest first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchDocument>>;
}
