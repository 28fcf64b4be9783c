use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{info, warn};

use super::{
    Delivery, DeliveryStream, MessageBroker, MessageHeaders, PublishOptions, QueueOptions,
};
use crate::BrokerError;

/// Publishing to a queue by name goes through the default exchange.
static DEFAULT_EXCHANGE: &str = "";

/// RabbitMQ broker. The connection and its single channel are opened once and
/// held until `close`.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

pub(crate) struct Consumer {
    inner: lapin::Consumer,
}

pub(crate) struct Payload(AmqpDelivery);

impl AmqpBroker {
    pub async fn connect(address: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(address, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection.create_channel().await?;

        info!("Connected to broker at {}", redact_credentials(address));

        Ok(Self {
            connection,
            channel,
        })
    }
}

#[async_trait::async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<u32, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.message_count())
    }

    async fn queue_depth(&self, name: &str) -> Result<u32, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.message_count())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(Consumer { inner: consumer }))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &MessageHeaders,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default().with_headers(to_field_table(headers));
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }

        self.channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "capture-pipeline shutting down")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

#[async_trait::async_trait]
impl DeliveryStream for Consumer {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let msg = self.inner.next().await.map(|delivery| {
            delivery
                .map_err(BrokerError::from)
                .map(|d| Box::new(Payload(d)) as Box<dyn Delivery>)
        });

        if msg.is_none() {
            warn!("Broker consumer ended");
        }

        msg
    }
}

#[async_trait::async_trait]
impl Delivery for Payload {
    fn data(&self) -> &[u8] {
        &self.0.data
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }

    fn headers(&self) -> MessageHeaders {
        self.0
            .properties
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default()
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn from_field_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}

/// Strip `user:password@` from an AMQP URI before it is logged.
fn redact_credentials(address: &str) -> String {
    match url::Url::parse(address) {
        Ok(mut parsed) if parsed.password().is_some() || !parsed.username().is_empty() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => address.to_string(),
    }
}
