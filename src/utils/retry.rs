//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Connection attempts are
//! scheduled by `RetryPolicy`; these builders cover the unbounded loops.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::bus::BusError;

/// Backoff between resubscribe attempts after a consumer loses its stream.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts (the loop stops on shutdown or close)
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Determines if a bus error is worth retrying.
///
/// Non-retryable:
/// - `Closed`: the connection was shut down on purpose
/// - `InvalidRoutingKey`, `Serialization`: the same input fails again
pub fn is_retryable(err: &BusError) -> bool {
    !matches!(
        err,
        BusError::Closed | BusError::InvalidRoutingKey(_) | BusError::Serialization(_)
    )
}
