//! The narrow slice of broker functionality the pipeline consumes.
//!
//! `amqp` talks to RabbitMQ; `memory` keeps queues in-process with the same
//! redelivery semantics and is what the test suite runs against.

use crate::BrokerError;
use std::collections::BTreeMap;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// String headers attached to a published message.
pub type MessageHeaders = BTreeMap<String, String>;

/// Header carrying the originating URL on output and dead-letter messages.
pub const URL_HEADER: &str = "url";
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";
pub const ERROR_HEADER: &str = "x-error";
pub const FAILED_AT_HEADER: &str = "x-failed-at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to write the message to disk (delivery mode 2).
    pub persistent: bool,
}

#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a queue. Idempotent. Returns the number of ready messages.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<u32, BrokerError>;

    /// Ready messages on an existing queue. Never creates the queue and
    /// fails if it does not exist.
    async fn queue_depth(&self, name: &str) -> Result<u32, BrokerError>;

    /// Start consuming with manual acknowledgement and at most `prefetch`
    /// unacknowledged deliveries outstanding.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Fire-and-forget enqueue.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &MessageHeaders,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait::async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, or `None` once the broker stops the consumer.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>>;
}

/// A message handed to this consumer and not yet resolved.
///
/// Resolution consumes the delivery so it can be acked or rejected only once.
#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    fn data(&self) -> &[u8];
    fn redelivered(&self) -> bool;
    fn headers(&self) -> MessageHeaders;
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}
