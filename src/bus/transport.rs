//! Transport seam between the connection lifecycle and a concrete broker.
//!
//! A `Connector` dials the broker and hands back one `BrokerChannel`. The
//! connection layer never talks to a client library directly, so the AMQP
//! backend and the in-memory broker are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{BusError, Result};
use crate::dlq::DeadLetterTopology;

/// Callback invoked by a transport when the connection dies out-of-band.
///
/// Transports call it from their own threads or tasks, so it must not block.
pub type LossHook = Arc<dyn Fn(String) + Send + Sync>;

/// Stream of inbound deliveries for one subscription.
///
/// The stream ends when the channel or connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Exchange layout every channel is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Name of the shared durable topic exchange.
    pub exchange: String,
    /// Dead-letter routing for nacked messages, if enabled.
    pub dead_letter: Option<DeadLetterTopology>,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: u16,
}

impl Topology {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            dead_letter: None,
            prefetch: 1,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterTopology) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

/// A serialized message ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub message_id: String,
}

/// How the broker answered a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirmed by the broker.
    Published,
    /// Broker applied flow control or refused the message (negative confirm).
    /// Not a transport failure; the caller decides whether to retry.
    Buffered,
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial, open one channel and declare the topology's exchange.
    ///
    /// Declaring must be idempotent. `on_lost` is called at most once per
    /// returned channel when the underlying connection errors or closes.
    async fn open(&self, topology: &Topology, on_lost: LossHook) -> Result<Arc<dyn BrokerChannel>>;

    /// Address used in logs.
    fn endpoint(&self) -> String;
}

/// A single logical channel on an open connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// False once the channel or its connection has gone away.
    fn is_open(&self) -> bool;

    /// Publish a persistent message to the shared exchange.
    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<PublishOutcome>;

    /// Declare an exclusive, auto-delete, server-named queue, bind it under
    /// `binding_key` and start a manual-ack consumer on it.
    ///
    /// Returns the broker-assigned queue name and the delivery stream.
    async fn consume(&self, binding_key: &str) -> Result<(String, DeliveryStream)>;

    /// Close the channel and then its connection.
    async fn close(&self) -> Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// An inbound message awaiting acknowledgement.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        message_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            message_id,
            redelivered,
            acker,
        }
    }

    /// Remove the message from its queue permanently.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge without requeue. The broker drops the message
    /// or routes it to the queue's dead-letter exchange.
    pub async fn reject(self) -> Result<()> {
        self.nack(false).await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    /// Body rendered for logs, truncated.
    pub fn preview(&self) -> String {
        const MAX: usize = 256;
        let text = String::from_utf8_lossy(&self.body);
        if text.len() <= MAX {
            return text.into_owned();
        }
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Topic-exchange matching of a routing key against a binding pattern.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}

/// Convenience for transports mapping client errors.
pub(crate) fn connection_error(context: &str, err: impl std::fmt::Display) -> BusError {
    BusError::Connection(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_exact_match() {
        assert!(topic_matches("post.deleted", "post.deleted"));
        assert!(!topic_matches("post.deleted", "post.created"));
        assert!(!topic_matches("post", "post.deleted"));
    }

    #[test]
    fn test_topic_star_matches_one_word() {
        assert!(topic_matches("post.*", "post.deleted"));
        assert!(!topic_matches("post.*", "post.deleted.v2"));
        assert!(!topic_matches("post.*", "post"));
    }

    #[test]
    fn test_topic_hash_matches_any_suffix() {
        assert!(topic_matches("#", "post.deleted"));
        assert!(topic_matches("post.#", "post"));
        assert!(topic_matches("post.#", "post.deleted.v2"));
        assert!(topic_matches("#.deleted", "media.deleted"));
        assert!(!topic_matches("media.#", "post.deleted"));
    }

    #[test]
    fn test_topology_prefetch_floor() {
        let topology = Topology::new("x").with_prefetch(0);
        assert_eq!(topology.prefetch, 1);
    }
}
