//! Shared utilities for integration tests.
//!
//! Builds service cores on a shared in-memory broker and cache so several
//! "services" can exchange events inside one test process.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use socialmesh::bus::InMemoryBroker;
use socialmesh::cache::InMemoryCacheStore;
use socialmesh::config::Config;
use socialmesh::utils::bootstrap::init_tracing;
use socialmesh::ServiceCore;

/// In-memory config with millisecond retry delays.
pub fn fast_config() -> Config {
    let mut config = Config::for_test();
    config.messaging.max_connect_retries = 3;
    config.messaging.retry_delay_ms = 5;
    config.messaging.max_retry_delay_ms = 20;
    config
}

/// A service core attached to `broker`, with its own cache store.
pub async fn service(broker: &InMemoryBroker) -> (ServiceCore, Arc<InMemoryCacheStore>) {
    init_tracing();
    let store = Arc::new(InMemoryCacheStore::new());
    let core = ServiceCore::builder(fast_config())
        .with_connector(Arc::new(broker.connector()))
        .with_cache_store(store.clone())
        .build()
        .await
        .expect("Failed to build service core");
    (core, store)
}

/// Poll `condition` until it holds, for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Async variant of `eventually`.
pub async fn eventually_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
