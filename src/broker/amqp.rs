//! AMQP (RabbitMQ) broker implementation.
//!
//! Connections come from a `deadpool-lapin` pool; each `AmqpChannel` wraps one
//! lapin channel in publisher-confirm mode so a publish only succeeds once
//! the broker has taken responsibility for the message.

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    Acker, BrokerChannel, BrokerError, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, QueueSpec, Result, Routed,
};
use crate::codec::CONTENT_TYPE;

/// Maximum pooled AMQP connections. Channels are multiplexed over them.
const MAX_CONNECTIONS: usize = 2;

/// Map a lapin error, recognising broker-side declaration conflicts.
fn map_error(context: &str, err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            BrokerError::PreconditionFailed(format!("{}: {}", context, err))
        }
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            BrokerError::NotFound(format!("{}: {}", context, err))
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Connection(format!("{}: {}", context, err))
        }
        _ => BrokerError::Channel(format!("{}: {}", context, err)),
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

/// Opens confirm-mode channels on pooled RabbitMQ connections.
pub struct AmqpConnector {
    pool: Pool,
    url: String,
}

impl AmqpConnector {
    /// Create a connector. No connection is made until the first channel.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let manager = Manager::new(url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(MAX_CONNECTIONS)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        Ok(Self { pool, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_error("Failed to enable publisher confirms", e))?;

        info!(url = %self.url, channel_id = channel.id(), "Opened AMQP channel");

        Ok(AmqpChannel { channel })
    }
}

/// One lapin channel.
pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("Failed to declare exchange", e))
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error("Failed to declare queue", e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("Failed to bind queue", e))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<Routed> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(2); // persistent

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| map_error("Failed to publish", e))?;

        match confirm
            .await
            .map_err(|e| map_error("Publish confirmation failed", e))?
        {
            Confirmation::Ack(Some(returned)) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_code = returned.reply_code,
                    "Broker returned unroutable message"
                );
                Ok(Routed::Unroutable)
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(Routed::Delivered),
            Confirmation::Nack(_) => Err(BrokerError::Nacked(format!(
                "broker nacked publish to '{}' with key '{}'",
                exchange, routing_key
            ))),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| map_error("Failed to set prefetch", e))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error("Failed to start consumer", e))?;

        let stream = consumer.map(|delivery| match delivery {
            Ok(mut delivery) => {
                let body = std::mem::take(&mut delivery.data);
                let routing_key = delivery.routing_key.as_str().to_string();
                let redelivered = delivery.redelivered;
                Ok(Delivery::new(
                    body,
                    routing_key,
                    redelivered,
                    Box::new(AmqpAcker { delivery }),
                ))
            }
            Err(e) => Err(map_error("Consumer delivery error", e)),
        });

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Keeps the lapin delivery (body already taken) for its acker.
struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| map_error("Failed to ack message", e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| map_error("Failed to nack message", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.delivery
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| map_error("Failed to reject message", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(
            lapin_kind(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
        assert!(matches!(
            lapin_kind(ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        ));
    }

    #[test]
    fn test_connector_is_lazy() {
        // Building the pool must not touch the network.
        let connector = AmqpConnector::new("amqp://localhost:5672").unwrap();
        assert_eq!(connector.url(), "amqp://localhost:5672");
    }
}
