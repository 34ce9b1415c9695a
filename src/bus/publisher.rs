//! Domain event publisher.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::connection::BrokerConnection;
use super::transport::PublishOutcome;
use super::{validate_routing_key, BusError, DomainEvent, Result};

/// Publishes domain events to the shared exchange.
///
/// Makes exactly one attempt per call. A transport failure invalidates the
/// connection's channel so the next call reconnects; the failure itself is
/// returned to the caller, who decides whether delivery matters enough to
/// retry.
#[derive(Clone)]
pub struct EventPublisher {
    connection: Arc<BrokerConnection>,
}

impl EventPublisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Serialize `payload` and publish it under `routing_key`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<PublishOutcome> {
        let event = DomainEvent::new(routing_key, payload)?;
        self.publish_event(&event).await
    }

    /// Publish an already-built event.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(routing_key = %event.routing_key, message_id = %event.message_id)
    )]
    pub async fn publish_event(&self, event: &DomainEvent) -> Result<PublishOutcome> {
        validate_routing_key(&event.routing_key)?;
        let message = event.to_message()?;

        let lease = self.connection.acquire().await?;

        match lease.channel().publish(&event.routing_key, message).await {
            Ok(PublishOutcome::Published) => {
                info!("Event published");
                Ok(PublishOutcome::Published)
            }
            Ok(PublishOutcome::Buffered) => {
                warn!("Event not confirmed by broker (flow control); reported as buffered");
                Ok(PublishOutcome::Buffered)
            }
            Err(e) => {
                error!(error = %e, "Error publishing event");
                self.connection
                    .invalidate(lease.generation(), "publish failed");
                Err(match e {
                    BusError::Publish(_) => e,
                    other => BusError::Publish(other.to_string()),
                })
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("connection", &self.connection)
            .finish()
    }
}
