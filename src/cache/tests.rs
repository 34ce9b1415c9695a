use std::sync::atomic::{AtomicU32, Ordering};

use serde::Deserialize;

use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    id: String,
    content: String,
}

fn post(id: &str) -> Post {
    Post {
        id: id.to_string(),
        content: format!("content of {}", id),
    }
}

fn layer() -> (Arc<InMemoryCacheStore>, CacheLayer) {
    let store = Arc::new(InMemoryCacheStore::new());
    let layer = CacheLayer::new(store.clone(), CacheTtls::default());
    (store, layer)
}

#[tokio::test]
async fn test_set_then_get_returns_value() {
    let (_, cache) = layer();

    assert!(cache.set_for("post:p1", &post("p1"), TtlClass::Item).await);

    assert_eq!(cache.get::<Post>("post:p1").await, Some(post("p1")));
    assert_eq!(
        cache.get_raw("post:p1").await.unwrap(),
        serde_json::to_string(&post("p1")).unwrap()
    );
}

#[tokio::test]
async fn test_entry_expiry_is_in_future_and_enforced() {
    let (_, cache) = layer();
    cache.set("posts:1:10", &vec![post("p1")], Duration::from_millis(40)).await;

    let entry = cache.get_entry("posts:1:10").await.unwrap();
    assert!(entry.expires_at > Utc::now());

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(cache.get_entry("posts:1:10").await.is_none());
}

#[tokio::test]
async fn test_ttl_classes() {
    let (_, cache) = layer();
    cache.set_for("search:rust", &Vec::<Post>::new(), TtlClass::Search).await;

    let entry = cache.get_entry("search:rust").await.unwrap();
    let remaining = entry.expires_at - Utc::now();
    assert!(remaining <= chrono::Duration::seconds(120));
    assert!(remaining > chrono::Duration::seconds(100));
}

#[tokio::test]
async fn test_invalidate_prefix_removes_only_matching_keys() {
    let (store, cache) = layer();
    cache.set_for("posts:1:10", &1, TtlClass::Listing).await;
    cache.set_for("posts:2:10", &2, TtlClass::Listing).await;
    cache.set_for("post:p1", &post("p1"), TtlClass::Item).await;

    let removed = cache.invalidate_prefix("posts:").await;

    assert_eq!(removed, 2);
    assert_eq!(store.len(), 1);
    assert!(cache.get::<Post>("post:p1").await.is_some());
}

#[tokio::test]
async fn test_invalidate_missing_key_is_zero() {
    let (_, cache) = layer();
    assert_eq!(cache.invalidate("post:nope").await, 0);
    assert_eq!(cache.invalidate_prefix("posts:").await, 0);
}

#[tokio::test]
async fn test_unavailable_backend_degrades() {
    let (store, cache) = layer();
    cache.set_for("post:p1", &post("p1"), TtlClass::Item).await;
    store.set_unavailable(true);

    assert_eq!(cache.get::<Post>("post:p1").await, None);
    assert!(!cache.set_for("post:p2", &post("p2"), TtlClass::Item).await);
    assert_eq!(cache.invalidate("post:p1").await, 0);
    assert_eq!(cache.invalidate_prefix("posts:").await, 0);
    assert!(matches!(
        cache.try_invalidate("post:p1").await,
        Err(CacheError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_out_of_range_ttl_is_rejected() {
    let (store, cache) = layer();
    let ttl = Duration::from_secs(9_000_000_000_000);

    assert!(matches!(
        store.set_ex("post:p1", "{}".to_string(), ttl).await,
        Err(CacheError::InvalidTtl(_))
    ));
    assert!(!cache.set("post:p1", &post("p1"), ttl).await);
    assert!(!cache.set("post:p1", &post("p1"), Duration::MAX).await);
    assert_eq!(cache.get::<Post>("post:p1").await, None);
}

#[tokio::test]
async fn test_undecodable_value_is_a_miss() {
    let (store, cache) = layer();
    store
        .set_ex("post:p1", "not json".to_string(), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(cache.get::<Post>("post:p1").await, None);
    assert_eq!(cache.get_raw("post:p1").await.as_deref(), Some("not json"));
}

#[tokio::test]
async fn test_read_through_loads_once() {
    let (_, cache) = layer();
    let loads = AtomicU32::new(0);

    for _ in 0..3 {
        let value: std::result::Result<Post, String> = cache
            .read_through("post:p1", TtlClass::Item, || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(post("p1"))
            })
            .await;
        assert_eq!(value.unwrap(), post("p1"));
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_through_loader_error_caches_nothing() {
    let (store, cache) = layer();

    let value: std::result::Result<Post, String> = cache
        .read_through("post:p1", TtlClass::Item, || async { Err("db down".to_string()) })
        .await;

    assert_eq!(value.unwrap_err(), "db down");
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_read_through_survives_cache_outage() {
    let (store, cache) = layer();
    store.set_unavailable(true);

    let value: std::result::Result<Post, String> = cache
        .read_through("post:p1", TtlClass::Item, || async { Ok(post("p1")) })
        .await;

    assert_eq!(value.unwrap(), post("p1"));
}
