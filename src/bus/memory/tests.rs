use super::*;

fn noop_hook() -> LossHook {
    Arc::new(|_| {})
}

fn message(body: &str) -> OutboundMessage {
    OutboundMessage {
        body: body.as_bytes().to_vec(),
        message_id: uuid::Uuid::new_v4().to_string(),
    }
}

#[tokio::test]
async fn test_routes_only_to_matching_bindings() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();

    let (_, mut deleted) = channel.consume("post.deleted").await.unwrap();
    let (_, mut all) = channel.consume("#").await.unwrap();

    channel.publish("post.created", message("1")).await.unwrap();
    channel.publish("post.deleted", message("2")).await.unwrap();

    let first = all.next().await.unwrap().unwrap();
    let second = all.next().await.unwrap().unwrap();
    assert_eq!(first.routing_key, "post.created");
    assert_eq!(second.routing_key, "post.deleted");

    let only = deleted.next().await.unwrap().unwrap();
    assert_eq!(only.body, b"2".to_vec());
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();
    let (_, mut stream) = channel.consume("post.deleted").await.unwrap();

    channel.publish("post.deleted", message("x")).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert!(!delivery.redelivered);
    delivery.nack(true).await.unwrap();

    let again = stream.next().await.unwrap().unwrap();
    assert!(again.redelivered);
    again.ack().await.unwrap();

    assert_eq!(broker.nacked(), 1);
    assert_eq!(broker.acked(), 1);
}

#[tokio::test]
async fn test_reject_without_dead_letter_drops() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();
    let (_, mut stream) = channel.consume("post.deleted").await.unwrap();

    channel.publish("post.deleted", message("x")).await.unwrap();
    stream.next().await.unwrap().unwrap().reject().await.unwrap();

    assert_eq!(broker.nacked(), 1);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn test_close_removes_exclusive_queues() {
    let broker = InMemoryBroker::new();
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();
    let (queue, mut stream) = channel.consume("post.deleted").await.unwrap();
    assert_eq!(broker.queues(), vec![queue]);

    channel.close().await.unwrap();

    assert!(!channel.is_open());
    assert!(broker.queues().is_empty());
    assert!(stream.next().await.is_none());
    assert!(channel.publish("post.deleted", message("x")).await.is_err());
}

#[tokio::test]
async fn test_sever_fires_loss_hook_once_per_connection() {
    let broker = InMemoryBroker::new();
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    let hook: LossHook = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let channel = broker
        .connector()
        .open(&Topology::new("events"), hook)
        .await
        .unwrap();

    broker.sever_connections("test");
    broker.sever_connections("again");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!channel.is_open());
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_scripted_connect_failures() {
    let broker = InMemoryBroker::new();
    let connector = broker.connector();
    connector.fail_next(1);

    assert!(connector.open(&Topology::new("events"), noop_hook()).await.is_err());
    assert!(connector.open(&Topology::new("events"), noop_hook()).await.is_ok());
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn test_history_keeps_most_recent_messages() {
    let broker = InMemoryBroker::with_history_limit(2);
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();

    for body in ["1", "2", "3"] {
        channel.publish("post.created", message(body)).await.unwrap();
    }

    let bodies: Vec<Vec<u8>> = broker.published().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec![b"2".to_vec(), b"3".to_vec()]);
}

#[tokio::test]
async fn test_zero_history_limit_records_nothing() {
    let broker = InMemoryBroker::with_history_limit(0);
    let channel = broker
        .connector()
        .open(&Topology::new("events"), noop_hook())
        .await
        .unwrap();

    channel.publish("post.created", message("1")).await.unwrap();

    assert!(broker.published().is_empty());
}
