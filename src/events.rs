//! Post domain events exchanged between services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Routing key for a newly created post.
pub const POST_CREATED: &str = "post.created";
/// Routing key for a deleted post.
pub const POST_DELETED: &str = "post.deleted";

/// Payload of `post.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreated {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Payload of `post.deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDeleted {
    pub post_id: String,
    /// Author of the post. Not every publisher sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Media attached to the post. Older publishers omit it.
    #[serde(default)]
    pub media_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_deleted_wire_format() {
        let event = PostDeleted {
            post_id: "p1".into(),
            user_id: Some("u1".into()),
            media_ids: vec!["m1".into(), "m2".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"postId": "p1", "userId": "u1", "mediaIds": ["m1", "m2"]})
        );
    }

    #[test]
    fn test_post_deleted_without_media() {
        let event: PostDeleted =
            serde_json::from_str(r#"{"postId":"p1","userId":"u1"}"#).unwrap();
        assert!(event.media_ids.is_empty());
    }

    #[test]
    fn test_post_deleted_without_author() {
        let event: PostDeleted =
            serde_json::from_str(r#"{"postId":"p1","mediaIds":["m1","m2"]}"#).unwrap();
        assert_eq!(event.user_id, None);
        assert_eq!(event.media_ids, vec!["m1", "m2"]);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"postId": "p1", "mediaIds": ["m1", "m2"]})
        );
    }

    #[test]
    fn test_post_created_requires_fields() {
        let result: Result<PostCreated, _> = serde_json::from_str(r#"{"postId":"p1"}"#);
        assert!(result.is_err());
    }
}
