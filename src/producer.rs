//! Job source: puts URL jobs on the input queue.

use crate::broker::{MessageBroker, MessageHeaders, PublishOptions, QueueOptions};
use crate::{validate_url, Config, Job, PipelineError};
use std::sync::Arc;
use tracing::{info, warn};

pub struct JobSource {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    durable: bool,
}

impl JobSource {
    pub fn new(broker: Arc<dyn MessageBroker>, config: &Config) -> Self {
        Self {
            broker,
            queue: config.input_queue.clone(),
            durable: config.queues.input,
        }
    }

    async fn declare(&self) -> Result<u32, PipelineError> {
        Ok(self
            .broker
            .declare_queue(
                &self.queue,
                QueueOptions {
                    durable: self.durable,
                },
            )
            .await?)
    }

    /// Validate and enqueue one URL. Jobs on a durable queue are published persistent.
    pub async fn enqueue(&self, url: &str) -> Result<(), PipelineError> {
        self.declare().await?;
        self.publish(url).await
    }

    async fn publish(&self, url: &str) -> Result<(), PipelineError> {
        validate_url(url)?;
        // the caller's spelling is kept so output headers match what was enqueued
        let job = Job {
            url: url.trim().to_string(),
            redelivered: false,
        };

        self.broker
            .publish(
                &self.queue,
                &job.to_payload()?,
                &MessageHeaders::new(),
                PublishOptions {
                    persistent: self.durable,
                },
            )
            .await?;

        info!("Enqueued {} on '{}'", job.url, self.queue);
        Ok(())
    }

    /// Enqueue every valid URL; invalid ones are logged and skipped.
    /// Returns how many were enqueued.
    pub async fn enqueue_many(&self, urls: &[String]) -> Result<usize, PipelineError> {
        self.declare().await?;

        let mut enqueued = 0;
        for url in urls {
            match self.publish(url).await {
                Ok(()) => enqueued += 1,
                Err(PipelineError::MalformedPayload(reason)) => {
                    warn!("Skipping invalid URL {}", reason);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Added {} of {} URLs to '{}'", enqueued, urls.len(), self.queue);
        Ok(enqueued)
    }

    /// Number of messages ready on `queue`. The queue must already exist.
    pub async fn queue_depth(&self, queue: &str) -> Result<u32, PipelineError> {
        Ok(self.broker.queue_depth(queue).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn source(broker: &MemoryBroker) -> JobSource {
        JobSource::new(Arc::new(broker.clone()), &Config::default())
    }

    #[tokio::test]
    async fn enqueue_publishes_persistent_url_job() {
        let broker = MemoryBroker::new();
        source(&broker).enqueue("https://example.com").await.unwrap();

        let published = broker.published_to("url_queue");
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
        let job = Job::from_delivery(&published[0].payload, false).unwrap();
        assert_eq!(job.url, "https://example.com");
        assert_eq!(broker.is_durable("url_queue"), Some(true));
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_url() {
        let broker = MemoryBroker::new();
        let result = source(&broker).enqueue("not a url").await;
        assert!(matches!(result, Err(PipelineError::MalformedPayload(_))));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn enqueue_many_skips_invalid_and_reports_depth() {
        let broker = MemoryBroker::new();
        let source = source(&broker);
        let urls = vec![
            "https://example.com".to_string(),
            "mailto:someone@example.com".to_string(),
            "https://slow.example".to_string(),
        ];

        assert_eq!(source.enqueue_many(&urls).await.unwrap(), 2);
        assert_eq!(source.queue_depth("url_queue").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn depth_of_missing_queue_errors_without_declaring_it() {
        let broker = MemoryBroker::new();
        let source = source(&broker);

        let result = source.queue_depth("url_queue.dead_letter").await;
        assert!(matches!(result, Err(PipelineError::Broker(_))));
        assert_eq!(broker.is_durable("url_queue.dead_letter"), None);
        assert!(source.queue_depth("url_queue.dead_letter").await.is_err());
    }
}
