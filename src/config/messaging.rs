//! Messaging (broker) configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{BackoffKind, RetryPolicy, Topology, DEFAULT_EXCHANGE};
use crate::dlq::DeadLetterConfig;

/// Broker backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependency).
    Memory,
    /// AMQP/RabbitMQ.
    #[default]
    Amqp,
}

/// Messaging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP connection URL.
    pub url: String,
    /// Shared topic exchange.
    pub exchange: String,
    /// Connection attempts before giving up.
    pub max_connect_retries: u32,
    /// Delay before the first reconnect attempt.
    pub retry_delay_ms: u64,
    /// Cap for growing backoffs.
    pub max_retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub jitter: bool,
    /// Unacknowledged deliveries per subscription.
    pub prefetch: u16,
    pub dead_letter: DeadLetterConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            max_connect_retries: 10,
            retry_delay_ms: 3000,
            max_retry_delay_ms: 30_000,
            backoff: BackoffKind::Fixed,
            jitter: false,
            prefetch: 1,
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

impl MessagingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_connect_retries,
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            backoff: self.backoff,
            jitter: self.jitter,
        }
    }

    pub fn topology(&self) -> Topology {
        let topology = Topology::new(self.exchange.clone()).with_prefetch(self.prefetch);
        match self.dead_letter.topology(&self.exchange) {
            Some(dead_letter) => topology.with_dead_letter(dead_letter),
            None => topology,
        }
    }
}
