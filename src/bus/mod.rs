//! Event bus for cross-service delivery.
//!
//! This module contains:
//! - `BrokerConnection`: owns the broker connection and its single channel
//! - `EventPublisher`: publishes domain events to the shared topic exchange
//! - `EventConsumer`: per-routing-key subscriptions with manual ack/nack
//! - `EventHandler` trait: for processing inbound events
//! - Transports: AMQP (RabbitMQ) and an in-memory broker

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::store::StoreError;

pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;


// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use connection::{BackoffKind, BrokerConnection, BrokerState, ChannelLease, RetryPolicy, RetryState};
pub use consumer::{DeliveryOutcome, EventConsumer, Subscription};
pub use memory::{InMemoryBroker, InMemoryConnector, DEFAULT_HISTORY_LIMIT};
pub use publisher::EventPublisher;
pub use transport::{
    topic_matches, BrokerChannel, Connector, Delivery, DeliveryStream, LossHook, OutboundMessage,
    PublishOutcome, Topology,
};

/// Default name of the shared topic exchange.
pub const DEFAULT_EXCHANGE: &str = "socialmedia_events";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to connect to broker after {attempts} attempts: {reason}")]
    ConnectExhausted { attempts: u32, reason: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Invalid routing key '{0}'")]
    InvalidRoutingKey(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker connection is closed")]
    Closed,
}

impl BusError {
    /// True for the startup-fatal error class.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::ConnectExhausted { .. } | BusError::Closed)
    }
}

/// Errors returned by event handlers.
///
/// Any error causes the delivery to be nacked without requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

// ============================================================================
// Domain events
// ============================================================================

/// A domain event travelling over the shared exchange.
///
/// On the wire only `payload` forms the message body; the routing key and
/// message id travel as broker metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub routing_key: String,
    pub message_id: String,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Build an event from any serializable payload.
    pub fn new<T: Serialize + ?Sized>(routing_key: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            routing_key: routing_key.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a typed record.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serialize for publishing. The payload is encoded exactly once here.
    pub fn to_message(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage {
            body: serde_json::to_vec(&self.payload)?,
            message_id: self.message_id.clone(),
        })
    }

    /// Rebuild an event from an inbound delivery.
    pub fn from_delivery(delivery: &Delivery) -> std::result::Result<Self, serde_json::Error> {
        let payload: serde_json::Value = serde_json::from_slice(&delivery.body)?;
        Ok(Self {
            routing_key: delivery.routing_key.clone(),
            message_id: delivery.message_id.clone().unwrap_or_default(),
            payload,
        })
    }
}

/// Validate a routing key used for publishing.
///
/// Keys are dot-separated, non-empty words. Wildcards are only meaningful in
/// bindings and are rejected here.
pub fn validate_routing_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .split('.')
            .all(|word| !word.is_empty() && !word.contains(['*', '#']) && !word.contains(char::is_whitespace));
    if valid {
        Ok(())
    } else {
        Err(BusError::InvalidRoutingKey(key.to_string()))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for processing events from a subscription.
///
/// Delivery is at-least-once, so implementations must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

/// Adapts an async closure into an `EventHandler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &DomainEvent) -> std::result::Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}
