//! Domain event consumer.
//!
//! Each subscription owns a private queue bound to one routing key and a
//! background task that hands deliveries to its handler one at a time.
//! Successful handling acks; failures nack without requeue so a poison
//! message can never wedge the queue.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::BrokerConnection;
use super::transport::{Delivery, DeliveryStream};
use super::{BusError, DomainEvent, EventHandler, Result};
use crate::utils::retry::{is_retryable, resubscribe_backoff};

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; message acknowledged.
    Acked,
    /// Handler failed; message nacked without requeue.
    HandlerFailed,
    /// Payload was not valid JSON; message nacked without requeue.
    DecodeFailed,
}

/// Creates subscriptions on the shared exchange.
#[derive(Clone)]
pub struct EventConsumer {
    connection: Arc<BrokerConnection>,
}

impl EventConsumer {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    /// Bind a private queue to `routing_key` and start delivering to `handler`.
    ///
    /// The routing key may use topic wildcards (`*`, `#`).
    pub async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        if routing_key.is_empty() {
            return Err(BusError::InvalidRoutingKey(String::new()));
        }

        let (generation, queue, stream) = open_queue(&self.connection, routing_key).await?;

        let (queue_tx, queue_rx) = watch::channel(queue.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = ConsumerLoop {
            connection: Arc::clone(&self.connection),
            routing_key: routing_key.to_string(),
            handler,
            queue: queue_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(consumer.run(stream, generation));

        info!(routing_key = %routing_key, queue = %queue, "Subscribed to event");

        Ok(Subscription {
            routing_key: routing_key.to_string(),
            queue: queue_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle stops consumption after the in-flight message; use
/// `unsubscribe` to wait for that message to finish.
pub struct Subscription {
    routing_key: String,
    queue: watch::Receiver<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Broker-assigned queue name. Changes after a resubscribe.
    pub fn queue_name(&self) -> String {
        self.queue.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop consuming. An in-flight handler runs to completion first.
    pub async fn unsubscribe(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(routing_key = %self.routing_key, error = %e, "Consumer task panicked");
        }
        info!(routing_key = %self.routing_key, "Unsubscribed");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("routing_key", &self.routing_key)
            .field("queue", &*self.queue.borrow())
            .field("active", &self.is_active())
            .finish()
    }
}

async fn open_queue(
    connection: &BrokerConnection,
    routing_key: &str,
) -> Result<(u64, String, DeliveryStream)> {
    let lease = connection.acquire().await?;
    match lease.channel().consume(routing_key).await {
        Ok((queue, stream)) => Ok((lease.generation(), queue, stream)),
        Err(e) => {
            error!(routing_key = %routing_key, error = %e, "Error consuming event");
            connection.invalidate(lease.generation(), "subscribe failed");
            Err(BusError::Subscribe(e.to_string()))
        }
    }
}

struct ConsumerLoop {
    connection: Arc<BrokerConnection>,
    routing_key: String,
    handler: Arc<dyn EventHandler>,
    queue: watch::Sender<String>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerLoop {
    async fn run(mut self, mut stream: DeliveryStream, mut generation: u64) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    process_delivery(delivery, self.handler.as_ref(), &self.routing_key).await;
                    continue;
                }
                Some(Err(e)) => {
                    error!(routing_key = %self.routing_key, error = %e, "Consumer delivery error, will resubscribe");
                    self.connection
                        .invalidate(generation, "delivery stream error");
                }
                None => {
                    warn!(routing_key = %self.routing_key, "Consumer stream ended, resubscribing");
                }
            }

            match self.resubscribe().await {
                Some((new_generation, new_stream)) => {
                    generation = new_generation;
                    stream = new_stream;
                }
                None => break,
            }
        }

        info!(routing_key = %self.routing_key, "Consumer stopped");
    }

    /// Re-acquire a channel and bind a fresh queue, backing off between
    /// failures. Returns `None` on shutdown or once the connection is closed.
    async fn resubscribe(&mut self) -> Option<(u64, DeliveryStream)> {
        let mut backoff = resubscribe_backoff().build();

        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return None,
                attempt = open_queue(&self.connection, &self.routing_key) => attempt,
            };

            match attempt {
                Ok((generation, queue, stream)) => {
                    info!(routing_key = %self.routing_key, queue = %queue, "Resubscribed to event");
                    self.queue.send_replace(queue);
                    return Some((generation, stream));
                }
                Err(e) if !is_retryable(&e) => {
                    info!(routing_key = %self.routing_key, error = %e, "Not resubscribing");
                    return None;
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        routing_key = %self.routing_key,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to resubscribe, retrying after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Decode, dispatch and settle one delivery.
pub(crate) async fn process_delivery(
    delivery: Delivery,
    handler: &dyn EventHandler,
    subscription: &str,
) -> DeliveryOutcome {
    let routing_key = delivery.routing_key.clone();
    let message_id = delivery.message_id.clone().unwrap_or_default();

    let event = match DomainEvent::from_delivery(&delivery) {
        Ok(event) => event,
        Err(e) => {
            error!(
                subscription = %subscription,
                routing_key = %routing_key,
                message_id = %message_id,
                payload = %delivery.preview(),
                error = %e,
                "Undecodable message, rejecting without requeue"
            );
            if let Err(e) = delivery.reject().await {
                error!(error = %e, "Failed to nack message");
            }
            return DeliveryOutcome::DecodeFailed;
        }
    };

    debug!(
        routing_key = %routing_key,
        message_id = %message_id,
        redelivered = delivery.redelivered,
        "Received event"
    );

    let consume_span = tracing::info_span!("bus.consume", routing_key = %routing_key);
    let result = handler.handle(&event).instrument(consume_span).await;

    match result {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                error!(routing_key = %routing_key, error = %e, "Failed to ack message");
            }
            DeliveryOutcome::Acked
        }
        Err(e) => {
            error!(
                subscription = %subscription,
                routing_key = %routing_key,
                message_id = %message_id,
                payload = %delivery.preview(),
                error = %e,
                "Error processing message, nacking without requeue"
            );
            if let Err(e) = delivery.reject().await {
                error!(routing_key = %routing_key, error = %e, "Failed to nack message");
            }
            DeliveryOutcome::HandlerFailed
        }
    }
}
