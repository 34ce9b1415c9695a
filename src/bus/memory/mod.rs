//! In-memory broker for tests and local runs.
//!
//! Models the parts of a topic-exchange broker the core relies on: durable
//! exchange declaration, exclusive auto-delete queues that vanish with their
//! connection, manual ack/nack, negative confirms under flow control and
//! dead-letter routing. Failure injection hooks let tests script connection
//! refusals, publish errors and dropped connections.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::transport::{
    connection_error, topic_matches, Acknowledger, BrokerChannel, Connector, Delivery,
    DeliveryStream, LossHook, OutboundMessage, PublishOutcome, Topology,
};
use super::{BusError, Result};
use crate::dlq::{DeadLetter, DeadLetterTopology};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
struct Envelope {
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

struct QueueState {
    exchange: String,
    binding_key: String,
    connection_id: u64,
    dead_letter: Option<DeadLetterTopology>,
    sender: mpsc::UnboundedSender<Envelope>,
}

struct ConnectionState {
    open: Arc<AtomicBool>,
    on_lost: LossHook,
}

/// A message as recorded by the broker on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    /// Body decoded as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Default)]
struct BrokerInner {
    exchanges: BTreeSet<String>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    published: VecDeque<PublishedMessage>,
    dead_letters: VecDeque<DeadLetter>,
    history_limit: usize,
    acked: usize,
    nacked: usize,
    next_id: u64,
    flow_blocked: bool,
    publish_failures: u32,
}

/// Published messages and dead letters kept for inspection, per broker.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Shared in-memory broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker keeping at most `limit` published messages and dead letters;
    /// the oldest are dropped first.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                history_limit: limit,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector that dials this broker.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector::new(self.clone())
    }

    /// Declared exchange names.
    pub fn exchanges(&self) -> Vec<String> {
        self.lock().exchanges.iter().cloned().collect()
    }

    /// Names of live queues.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every message accepted by the broker, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.iter().cloned().collect()
    }

    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn nacked(&self) -> usize {
        self.lock().nacked
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// While blocked, publishes are refused with a negative confirm.
    pub fn set_flow_blocked(&self, blocked: bool) {
        self.lock().flow_blocked = blocked;
    }

    /// Fail the next `count` publishes with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().publish_failures = count;
    }

    /// Deliver raw bytes through the exchange, bypassing any channel.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> usize {
        self.route(
            exchange,
            Envelope {
                routing_key: routing_key.to_string(),
                body,
                message_id: None,
                redelivered: false,
            },
        )
    }

    /// Drop every open connection as if the broker went away.
    ///
    /// Queues are deleted, delivery streams end, and each connection's loss
    /// hook fires.
    pub fn sever_connections(&self, reason: &str) {
        let hooks: Vec<LossHook> = {
            let mut inner = self.lock();
            let ids: Vec<u64> = inner.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| Self::drop_connection(&mut inner, id))
                .collect()
        };
        info!(count = hooks.len(), reason = %reason, "Severing in-memory broker connections");
        for hook in hooks {
            hook(reason.to_string());
        }
    }

    fn register_connection(&self, topology: &Topology, on_lost: LossHook) -> (u64, Arc<AtomicBool>) {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let open = Arc::new(AtomicBool::new(true));
        inner.connections.insert(
            id,
            ConnectionState {
                open: Arc::clone(&open),
                on_lost,
            },
        );
        inner.exchanges.insert(topology.exchange.clone());
        if let Some(dead_letter) = &topology.dead_letter {
            inner.exchanges.insert(dead_letter.exchange.clone());
        }
        (id, open)
    }

    /// Remove a connection and its exclusive queues. Returns its loss hook.
    fn drop_connection(inner: &mut BrokerInner, id: u64) -> Option<LossHook> {
        let state = inner.connections.remove(&id)?;
        state.open.store(false, Ordering::SeqCst);
        inner.queues.retain(|_, queue| queue.connection_id != id);
        Some(state.on_lost)
    }

    fn route(&self, exchange: &str, envelope: Envelope) -> usize {
        let inner = self.lock();
        let mut delivered = 0;
        for queue in inner.queues.values() {
            if queue.exchange == exchange
                && topic_matches(&queue.binding_key, &envelope.routing_key)
                && queue.sender.send(envelope.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn settle(&self, queue: &str, envelope: &Envelope, outcome: Settle) {
        let mut inner = self.lock();
        match outcome {
            Settle::Ack => inner.acked += 1,
            Settle::Nack { requeue } => {
                inner.nacked += 1;
                let Some(state) = inner.queues.get(queue) else {
                    return;
                };
                if requeue {
                    let mut again = envelope.clone();
                    again.redelivered = true;
                    let _ = state.sender.send(again);
                } else if state.dead_letter.is_some() {
                    let letter = DeadLetter {
                        routing_key: envelope.routing_key.clone(),
                        message_id: envelope.message_id.clone(),
                        body: envelope.body.clone(),
                        source_queue: queue.to_string(),
                    };
                    let limit = inner.history_limit;
                    record(&mut inner.dead_letters, letter, limit);
                }
            }
        }
    }
}

fn record<T>(history: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    while history.len() >= limit {
        history.pop_front();
    }
    history.push_back(item);
}

enum Settle {
    Ack,
    Nack { requeue: bool },
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &inner.exchanges)
            .field("queues", &inner.queues.len())
            .field("connections", &inner.connections.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Default)]
struct ConnectPlan {
    attempts: AtomicU32,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
}

/// Connector for an `InMemoryBroker` with scripted connection failures.
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    plan: Arc<ConnectPlan>,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            plan: Arc::new(ConnectPlan::default()),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.plan.failures_left.store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until cleared.
    pub fn fail_always(&self, fail: bool) {
        self.plan.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Connection attempts seen so far.
    pub fn attempts(&self) -> u32 {
        self.plan.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.plan.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.plan
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn open(&self, topology: &Topology, on_lost: LossHook) -> Result<Arc<dyn BrokerChannel>> {
        self.plan.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(connection_error("in-memory broker", "connection refused"));
        }

        let (connection_id, open) = self.broker.register_connection(topology, on_lost);
        debug!(connection_id, exchange = %topology.exchange, "In-memory connection opened");

        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            topology: topology.clone(),
            connection_id,
            open,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

// ============================================================================
// Channel
// ============================================================================

struct InMemoryChannel {
    broker: InMemoryBroker,
    topology: Topology,
    connection_id: u64,
    open: Arc<AtomicBool>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(connection_error("in-memory channel", "channel is closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<PublishOutcome> {
        self.ensure_open()?;
        {
            let mut inner = self.broker.lock();
            if inner.publish_failures > 0 {
                inner.publish_failures -= 1;
                return Err(BusError::Publish("injected transport failure".to_string()));
            }
            if inner.flow_blocked {
                return Ok(PublishOutcome::Buffered);
            }
            let limit = inner.history_limit;
            let published = PublishedMessage {
                exchange: self.topology.exchange.clone(),
                routing_key: routing_key.to_string(),
                message_id: Some(message.message_id.clone()),
                body: message.body.clone(),
            };
            record(&mut inner.published, published, limit);
        }

        self.broker.route(
            &self.topology.exchange,
            Envelope {
                routing_key: routing_key.to_string(),
                body: message.body,
                message_id: Some(message.message_id),
                redelivered: false,
            },
        );
        Ok(PublishOutcome::Published)
    }

    async fn consume(&self, binding_key: &str) -> Result<(String, DeliveryStream)> {
        self.ensure_open()?;

        let queue = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();

        self.broker.lock().queues.insert(
            queue.clone(),
            QueueState {
                exchange: self.topology.exchange.clone(),
                binding_key: binding_key.to_string(),
                connection_id: self.connection_id,
                dead_letter: self.topology.dead_letter.clone(),
                sender,
            },
        );

        let broker = self.broker.clone();
        let queue_name = queue.clone();
        let stream = UnboundedReceiverStream::new(receiver)
            .map(move |envelope: Envelope| {
                let acker = MemoryAcker {
                    broker: broker.clone(),
                    queue: queue_name.clone(),
                    envelope: envelope.clone(),
                };
                Ok(Delivery::new(
                    envelope.routing_key,
                    envelope.body,
                    envelope.message_id,
                    envelope.redelivered,
                    Box::new(acker),
                ))
            })
            .boxed();

        Ok((queue, stream))
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.broker.lock();
        inner.connections.remove(&self.connection_id);
        inner
            .queues
            .retain(|_, queue| queue.connection_id != self.connection_id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    envelope: Envelope,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, &self.envelope, Settle::Ack);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker
            .settle(&self.queue, &self.envelope, Settle::Nack { requeue });
        Ok(())
    }
}
