//! Broker connection lifecycle.
//!
//! `BrokerConnection` is the only component that dials the broker. It owns
//! the current channel, retries with backoff on connect, and reacts to
//! out-of-band connection loss by dropping the channel. Nothing redials in
//! the background: the next publish or subscribe reconnects lazily.
//!
//! ```text
//!   Disconnected --connect--> Connecting --ok--> Connected
//!        ^                        |                  |
//!        +------exhausted---------+      loss/invalidate
//!        +-------------------------------------------+
//!   any --close--> Closing --> Disconnected (terminal)
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::transport::{BrokerChannel, Connector, LossHook, Topology};
use super::{BusError, Result};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Shape of the delay between connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay grows by `initial_delay` per attempt.
    Linear,
    /// Delay doubles per attempt.
    Exponential,
}

/// Bounded retry policy for connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for growing backoffs.
    pub max_delay: Duration,
    pub backoff: BackoffKind,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            backoff: BackoffKind::Fixed,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delays to sleep between consecutive attempts, starting at `initial`.
    pub fn delays(&self, initial: Duration) -> Box<dyn Iterator<Item = Duration> + Send> {
        let max_delay = self.max_delay.max(initial);
        let times = self.max_retries.max(1) as usize;

        match self.backoff {
            BackoffKind::Fixed => {
                let mut builder = ConstantBuilder::default()
                    .with_delay(initial)
                    .with_max_times(times);
                if self.jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build())
            }
            BackoffKind::Linear => Box::new(
                (1u32..)
                    .map(move |step| initial.saturating_mul(step).min(max_delay))
                    .take(times),
            ),
            BackoffKind::Exponential => {
                let mut builder = ExponentialBuilder::default()
                    .with_min_delay(initial)
                    .with_max_delay(max_delay)
                    .with_max_times(times);
                if self.jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build())
            }
        }
    }
}

/// Progress of the current (or last) connect cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Delay slept after the most recent failed attempt.
    pub delay: Duration,
}

/// A channel together with the connection generation it belongs to.
///
/// Callers hand the generation back to `invalidate` so a failure on an old
/// channel never tears down a newer one.
#[derive(Clone)]
pub struct ChannelLease {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelLease {
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

struct Slot {
    state: BrokerState,
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
    retry: RetryState,
    shut_down: bool,
}

impl Slot {
    /// Drop the channel if it still belongs to `generation`.
    fn clear(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.channel.is_none() {
            return false;
        }
        self.channel = None;
        if self.state == BrokerState::Connected {
            self.state = BrokerState::Disconnected;
        }
        true
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the broker connection and its single channel.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    topology: Topology,
    policy: RetryPolicy,
    slot: Arc<Mutex<Slot>>,
    /// Single-flight guard: at most one connect cycle runs at a time.
    connecting: tokio::sync::Mutex<()>,
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn Connector>, topology: Topology, policy: RetryPolicy) -> Self {
        Self {
            connector,
            topology,
            policy,
            slot: Arc::new(Mutex::new(Slot {
                state: BrokerState::Disconnected,
                channel: None,
                generation: 0,
                retry: RetryState::default(),
                shut_down: false,
            })),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> BrokerState {
        lock(&self.slot).state
    }

    pub fn retry_state(&self) -> RetryState {
        lock(&self.slot).retry
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current channel if connected and still open.
    ///
    /// A channel found closed is treated as a lost connection.
    pub fn current(&self) -> Option<ChannelLease> {
        let mut slot = lock(&self.slot);
        if slot.state != BrokerState::Connected {
            return None;
        }
        let channel = slot.channel.clone()?;
        if channel.is_open() {
            return Some(ChannelLease {
                generation: slot.generation,
                channel,
            });
        }
        let generation = slot.generation;
        slot.clear(generation);
        warn!("Broker channel found closed; will reconnect");
        None
    }

    /// Channel for the next operation, connecting with the configured policy
    /// if there is none.
    pub async fn acquire(&self) -> Result<ChannelLease> {
        self.connect(self.policy.max_retries, self.policy.initial_delay)
            .await
    }

    /// Open a connection and channel, retrying up to `max_retries` attempts.
    ///
    /// Returns the existing channel without dialing when already connected.
    /// Concurrent callers wait for an in-flight connect and reuse its channel.
    pub async fn connect(&self, max_retries: u32, initial_delay: Duration) -> Result<ChannelLease> {
        if let Some(lease) = self.current() {
            return Ok(lease);
        }
        self.ensure_open()?;

        let _single_flight = self.connecting.lock().await;

        if let Some(lease) = self.current() {
            debug!("Reusing channel opened by a concurrent connect");
            return Ok(lease);
        }
        self.ensure_open()?;

        let max_attempts = max_retries.max(1);
        let mut delays = self.policy.delays(initial_delay);
        {
            let mut slot = lock(&self.slot);
            slot.state = BrokerState::Connecting;
            slot.retry = RetryState {
                attempt: 0,
                max_attempts,
                delay: Duration::ZERO,
            };
        }

        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let generation = {
                let mut slot = lock(&self.slot);
                slot.generation += 1;
                slot.retry.attempt = attempt;
                slot.generation
            };

            info!(
                attempt,
                max_attempts,
                endpoint = %self.connector.endpoint(),
                "Connecting to broker"
            );

            match self
                .connector
                .open(&self.topology, self.loss_hook(generation))
                .await
            {
                Ok(channel) => {
                    let shut_down = {
                        let mut slot = lock(&self.slot);
                        if slot.shut_down {
                            true
                        } else {
                            slot.state = BrokerState::Connected;
                            slot.channel = Some(Arc::clone(&channel));
                            slot.retry = RetryState::default();
                            false
                        }
                    };

                    if shut_down {
                        let _ = channel.close().await;
                        return Err(BusError::Closed);
                    }

                    info!(
                        attempt,
                        exchange = %self.topology.exchange,
                        "Connected to broker"
                    );
                    return Ok(ChannelLease {
                        generation,
                        channel,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        let delay = delays.next().unwrap_or(initial_delay);
                        lock(&self.slot).retry.delay = delay;
                        info!(delay_ms = delay.as_millis() as u64, "Retrying broker connection");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        lock(&self.slot).state = BrokerState::Disconnected;
        error!(
            attempts = max_attempts,
            error = %last_error,
            "Giving up on broker connection"
        );

        Err(BusError::ConnectExhausted {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Forget the channel of `generation` after a transport failure.
    ///
    /// The next `acquire` reconnects.
    pub fn invalidate(&self, generation: u64, reason: &str) {
        if lock(&self.slot).clear(generation) {
            warn!(generation, reason = %reason, "Broker channel invalidated");
        }
    }

    /// Close channel and connection. Idempotent; the connection stays closed.
    pub async fn close(&self) -> Result<()> {
        let channel = {
            let mut slot = lock(&self.slot);
            if slot.shut_down && slot.channel.is_none() {
                return Ok(());
            }
            slot.shut_down = true;
            slot.state = BrokerState::Closing;
            slot.channel.take()
        };

        let result = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        lock(&self.slot).state = BrokerState::Disconnected;

        match &result {
            Ok(()) => info!("Broker connection closed gracefully"),
            Err(e) => error!(error = %e, "Error closing broker connection"),
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slot).shut_down
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn loss_hook(&self, generation: u64) -> LossHook {
        let slot: Weak<Mutex<Slot>> = Arc::downgrade(&self.slot);
        Arc::new(move |reason: String| {
            let Some(slot) = slot.upgrade() else {
                return;
            };
            if lock(&slot).clear(generation) {
                warn!(
                    generation,
                    reason = %reason,
                    "Broker connection lost; reconnecting on next use"
                );
            }
        })
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.connector.endpoint())
            .field("exchange", &self.topology.exchange)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
