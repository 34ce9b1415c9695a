//! AMQP (RabbitMQ) transport.
//!
//! One connection, one channel in confirm mode. Events go to a durable topic
//! exchange as persistent JSON messages; each subscription gets an exclusive,
//! auto-delete, server-named queue with a manual-ack consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, warn};

use super::transport::{
    connection_error, Acknowledger, BrokerChannel, Connector, Delivery, DeliveryStream, LossHook,
    OutboundMessage, PublishOutcome, Topology,
};
use super::{BusError, Result};

const CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;
const DEAD_LETTER_ARG: &str = "x-dead-letter-exchange";

/// Dials a RabbitMQ broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, topology: &Topology, on_lost: LossHook) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| connection_error("Failed to connect", e))?;

        let fired = Arc::new(AtomicBool::new(false));
        connection.on_error(move |err| {
            if !fired.swap(true, Ordering::SeqCst) {
                on_lost(err.to_string());
            }
        });

        let channel = match open_channel(&connection, topology).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(200, "channel setup failed").await {
                    warn!(error = %close_err, "Failed to close AMQP connection after setup error");
                }
                return Err(e);
            }
        };

        info!(
            exchange = %topology.exchange,
            url = %redact(&self.url),
            "Connected to AMQP"
        );

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            topology: topology.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        redact(&self.url)
    }
}

/// Confirm-mode channel with the exchange topology declared.
async fn open_channel(connection: &Connection, topology: &Topology) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| connection_error("Failed to create channel", e))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| connection_error("Failed to enable publisher confirms", e))?;

    declare_topology(&channel, topology).await?;
    Ok(channel)
}

async fn declare_topology(channel: &Channel, topology: &Topology) -> Result<()> {
    channel
        .exchange_declare(
            &topology.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| connection_error("Failed to declare exchange", e))?;

    if let Some(dead_letter) = &topology.dead_letter {
        channel
            .exchange_declare(
                &dead_letter.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_error("Failed to declare dead-letter exchange", e))?;

        channel
            .queue_declare(
                &dead_letter.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_error("Failed to declare dead-letter queue", e))?;

        channel
            .queue_bind(
                &dead_letter.queue,
                &dead_letter.exchange,
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_error("Failed to bind dead-letter queue", e))?;

        debug!(
            exchange = %dead_letter.exchange,
            queue = %dead_letter.queue,
            "Declared dead-letter topology"
        );
    }

    Ok(())
}

/// Arguments for a subscription queue.
fn queue_arguments(topology: &Topology) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dead_letter) = &topology.dead_letter {
        args.insert(
            DEAD_LETTER_ARG.into(),
            AMQPValue::LongString(dead_letter.exchange.clone().into()),
        );
    }
    args
}

/// Strip credentials from an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    topology: Topology,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<PublishOutcome> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_message_id(message.message_id.as_str().into());

        let confirm = self
            .channel
            .basic_publish(
                &self.topology.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        match confirm.await {
            Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                debug!(
                    exchange = %self.topology.exchange,
                    routing_key = %routing_key,
                    "Published event"
                );
                Ok(PublishOutcome::Published)
            }
            Ok(Confirmation::Nack(_)) => {
                warn!(routing_key = %routing_key, "Broker nacked publish");
                Ok(PublishOutcome::Buffered)
            }
            Err(e) => Err(BusError::Publish(format!(
                "Publish confirmation failed: {}",
                e
            ))),
        }
    }

    async fn consume(&self, binding_key: &str) -> Result<(String, DeliveryStream)> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                queue_arguments(&self.topology),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                &self.topology.exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        self.channel
            .basic_qos(self.topology.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        info!(
            queue = %queue_name,
            routing_key = %binding_key,
            "Bound queue to exchange"
        );

        let consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &format!("socialmesh-{}", uuid::Uuid::new_v4().simple()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(e) => Err(connection_error("Consumer error", e)),
            })
            .boxed();

        Ok((queue_name, stream))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Bye").await {
                error!(error = %e, "Failed to close AMQP channel");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "Bye")
                .await
                .map_err(|e| connection_error("Failed to close connection", e))?;
        }
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    Delivery::new(
        delivery.routing_key.as_str(),
        delivery.data,
        message_id,
        delivery.redelivered,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
