//! Media cascade on post deletion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bus::{DomainEvent, HandlerError};
use crate::coordinator::{EffectOutcome, SideEffect};
use crate::events::{PostDeleted, POST_DELETED};
use crate::store::MediaRepository;

/// Deletes the media attached to a deleted post.
///
/// Media that is already gone counts as deleted, so a redelivered event
/// succeeds with zero changes.
pub struct MediaCascade {
    repository: Arc<dyn MediaRepository>,
}

impl MediaCascade {
    /// Routing key this effect is registered under.
    pub const BINDING: &'static str = POST_DELETED;

    pub fn new(repository: Arc<dyn MediaRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl SideEffect for MediaCascade {
    fn name(&self) -> &str {
        "media-cascade"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<EffectOutcome, HandlerError> {
        let deleted: PostDeleted = event.payload_as()?;

        let mut removed = 0;
        for media_id in &deleted.media_ids {
            if self.repository.delete_media(media_id).await? {
                removed += 1;
            } else {
                debug!(media_id = %media_id, post_id = %deleted.post_id, "Media already deleted");
            }
        }

        info!(
            post_id = %deleted.post_id,
            requested = deleted.media_ids.len(),
            removed,
            "Deleted media of deleted post"
        );
        Ok(EffectOutcome::changed(removed))
    }
}
