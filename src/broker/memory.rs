//! In-process broker with at-least-once semantics.
//!
//! A delivery rejected with `requeue` goes back to the front of its queue with
//! the redelivered flag set. A consumer stream ends once its queue is empty,
//! which lets a worker drain a fixed set of jobs and return.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    Delivery, DeliveryStream, MessageBroker, MessageHeaders, PublishOptions, QueueOptions,
};
use crate::BrokerError;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    durability: HashMap<String, bool>,
    published: Vec<PublishedMessage>,
    resolutions: Vec<(Vec<u8>, Resolution)>,
    outstanding: usize,
    max_outstanding: usize,
    fail_publishes: bool,
    closed: bool,
}

/// Cloning shares the underlying queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

struct MemoryConsumer {
    queue: String,
    prefetch: usize,
    state: Arc<Mutex<State>>,
}

struct MemoryDelivery {
    queue: String,
    message: StoredMessage,
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Put a raw message on a queue as a fresh delivery.
    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                payload: payload.into(),
                headers: MessageHeaders::new(),
                redelivered: false,
            });
    }

    /// Messages waiting on a queue, front first.
    pub fn queued(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    /// Every ack and nack in order, keyed by the resolved payload.
    pub fn resolutions(&self) -> Vec<(Vec<u8>, Resolution)> {
        self.lock().resolutions.clone()
    }

    /// Highest number of simultaneously unresolved deliveries seen.
    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().durability.get(queue).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Make every subsequent publish fail as if the channel had dropped.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<u32, BrokerError> {
        let mut state = self.lock();
        if let Some(existing) = state.durability.get(name) {
            if *existing != options.durable {
                return Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"
                )));
            }
        }
        state.durability.insert(name.to_string(), options.durable);
        let depth = state.queues.entry(name.to_string()).or_default().len();
        Ok(depth as u32)
    }

    async fn queue_depth(&self, name: &str) -> Result<u32, BrokerError> {
        let state = self.lock();
        match state.queues.get(name) {
            Some(queue) => Ok(queue.len() as u32),
            None => Err(BrokerError::Channel(format!(
                "NOT_FOUND - no queue '{name}'"
            ))),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        if prefetch == 0 {
            return Err(BrokerError::Channel("prefetch must be at least 1".into()));
        }

        Ok(Box::new(MemoryConsumer {
            queue: queue.to_string(),
            prefetch: prefetch as usize,
            state: self.state.clone(),
        }))
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &MessageHeaders,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.fail_publishes || state.closed {
            return Err(BrokerError::Publish(format!("channel closed, cannot publish to '{queue}'")));
        }

        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
            persistent: options.persistent,
        });
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                payload: payload.to_vec(),
                headers: headers.clone(),
                redelivered: false,
            });

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.lock().closed = true;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeliveryStream for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let mut state = lock(&self.state);
        if state.closed {
            return None;
        }
        if state.outstanding >= self.prefetch {
            return Some(Err(BrokerError::Channel(format!(
                "consumer on '{}' asked for a delivery with {} unacknowledged",
                self.queue, state.outstanding
            ))));
        }

        let message = state.queues.get_mut(&self.queue)?.pop_front()?;
        state.outstanding += 1;
        state.max_outstanding = state.max_outstanding.max(state.outstanding);

        Some(Ok(Box::new(MemoryDelivery {
            queue: self.queue.clone(),
            message,
            state: self.state.clone(),
        })))
    }
}

impl MemoryDelivery {
    fn resolve(self, resolution: Resolution) {
        let mut state = lock(&self.state);
        state.outstanding -= 1;
        state
            .resolutions
            .push((self.message.payload.clone(), resolution));

        if let Resolution::Nack { requeue: true } = resolution {
            state
                .queues
                .entry(self.queue)
                .or_default()
                .push_front(StoredMessage {
                    redelivered: true,
                    ..self.message
                });
        }
    }
}

#[async_trait::async_trait]
impl Delivery for MemoryDelivery {
    fn data(&self) -> &[u8] {
        &self.message.payload
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    fn headers(&self) -> MessageHeaders {
        self.message.headers.clone()
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.resolve(Resolution::Ack);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.resolve(Resolution::Nack { requeue });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "url_queue";

    #[tokio::test]
    async fn requeued_delivery_comes_back_redelivered() {
        let broker = MemoryBroker::new();
        broker.push(QUEUE, "job");

        let mut consumer = broker.consume(QUEUE, "test", 1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert!(!first.redelivered());
        first.nack(true).await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert!(second.redelivered());
        assert_eq!(second.data(), b"job");
        second.ack().await.unwrap();

        assert!(consumer.next().await.is_none());
        assert_eq!(
            broker.resolutions(),
            vec![
                (b"job".to_vec(), Resolution::Nack { requeue: true }),
                (b"job".to_vec(), Resolution::Ack),
            ]
        );
    }

    #[tokio::test]
    async fn prefetch_bounds_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        broker.push(QUEUE, "a");
        broker.push(QUEUE, "b");

        let mut consumer = broker.consume(QUEUE, "test", 1).await.unwrap();
        let _held = consumer.next().await.unwrap().unwrap();
        assert!(matches!(
            consumer.next().await,
            Some(Err(BrokerError::Channel(_)))
        ));
        assert_eq!(broker.max_outstanding(), 1);
    }

    #[tokio::test]
    async fn declare_is_idempotent_but_rejects_durability_change() {
        let broker = MemoryBroker::new();
        broker.push(QUEUE, "a");

        let durable = QueueOptions { durable: true };
        assert_eq!(broker.declare_queue(QUEUE, durable).await.unwrap(), 1);
        assert_eq!(broker.declare_queue(QUEUE, durable).await.unwrap(), 1);
        assert!(broker
            .declare_queue(QUEUE, QueueOptions { durable: false })
            .await
            .is_err());
        assert_eq!(broker.is_durable(QUEUE), Some(true));
    }

    #[tokio::test]
    async fn queue_depth_does_not_create_queues() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.queue_depth(QUEUE).await,
            Err(BrokerError::Channel(_))
        ));
        assert!(broker.queue_depth(QUEUE).await.is_err());
        assert_eq!(broker.is_durable(QUEUE), None);

        broker.push(QUEUE, "a");
        assert_eq!(broker.queue_depth(QUEUE).await.unwrap(), 1);
        assert_eq!(broker.is_durable(QUEUE), None);
    }

    #[tokio::test]
    async fn publish_records_headers_and_enqueues() {
        let broker = MemoryBroker::new();
        let mut headers = MessageHeaders::new();
        headers.insert("url".into(), "https://example.com".into());

        broker
            .publish("out", b"png", &headers, PublishOptions { persistent: false })
            .await
            .unwrap();

        let published = broker.published_to("out");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].headers["url"], "https://example.com");
        assert_eq!(broker.queued("out").len(), 1);

        broker.fail_publishes(true);
        assert!(broker
            .publish("out", b"png", &headers, PublishOptions { persistent: false })
            .await
            .is_err());
    }
}
