//! Dead-letter routing for rejected deliveries.
//!
//! Consumers nack failed messages without requeue. By default the broker
//! drops them. When dead-lettering is enabled, every subscription queue is
//! declared with a dead-letter exchange so rejected messages are parked in a
//! durable queue for manual review and replay.
//!
//! ## Naming
//!
//! For the shared exchange `{exchange}`:
//! - dead-letter exchange: `{exchange}.dlx` (fanout, durable)
//! - dead-letter queue: `{exchange}.dlq` (durable, bound to the DLX)

use serde::Deserialize;

/// Suffix appended to the shared exchange name for the dead-letter exchange.
pub const DLX_SUFFIX: &str = "dlx";
/// Suffix appended to the shared exchange name for the dead-letter queue.
pub const DLQ_SUFFIX: &str = "dlq";

/// Build the dead-letter exchange name for an exchange.
pub fn dlx_for_exchange(exchange: &str) -> String {
    format!("{}.{}", exchange, DLX_SUFFIX)
}

/// Build the dead-letter queue name for an exchange.
pub fn dlq_for_exchange(exchange: &str) -> String {
    format!("{}.{}", exchange, DLQ_SUFFIX)
}

/// Resolved dead-letter exchange and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTopology {
    pub exchange: String,
    pub queue: String,
}

impl DeadLetterTopology {
    /// Default layout derived from the shared exchange name.
    pub fn for_exchange(exchange: &str) -> Self {
        Self {
            exchange: dlx_for_exchange(exchange),
            queue: dlq_for_exchange(exchange),
        }
    }
}

/// Dead-letter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Route nacked messages to a dead-letter queue instead of dropping them.
    pub enabled: bool,
    /// Override for the dead-letter exchange name.
    pub exchange: Option<String>,
    /// Override for the dead-letter queue name.
    pub queue: Option<String>,
}

impl DeadLetterConfig {
    /// Resolve names against the shared exchange. `None` when disabled.
    pub fn topology(&self, exchange: &str) -> Option<DeadLetterTopology> {
        if !self.enabled {
            return None;
        }
        let defaults = DeadLetterTopology::for_exchange(exchange);
        Some(DeadLetterTopology {
            exchange: self.exchange.clone().unwrap_or(defaults.exchange),
            queue: self.queue.clone().unwrap_or(defaults.queue),
        })
    }
}

/// A message that was rejected by its consumer and dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Routing key the message was originally published with.
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    /// Queue the message was rejected from.
    pub source_queue: String,
}
