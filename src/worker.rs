use crate::broker::{
    Delivery, MessageBroker, MessageHeaders, PublishOptions, QueueOptions, ERROR_HEADER,
    FAILED_AT_HEADER, FAILURE_REASON_HEADER, URL_HEADER,
};
use crate::{
    failure_outcome, BrokerError, CaptureResult, Config, Job, JobOutcome, JobState, Metrics,
    PipelineError, Renderer,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a job ended up on the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    RenderFailed,
    MalformedPayload,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::RenderFailed => "render_failed",
            DeadLetterReason::MalformedPayload => "malformed_payload",
        }
    }
}

/// Consumes URL jobs one at a time, renders them and routes the result.
///
/// The broker and renderer are owned by the caller and handed in; the worker
/// only drives deliveries through their lifecycle:
///
/// * render succeeds: image published to the output queue, delivery acked
/// * render fails on first delivery: delivery rejected with requeue
/// * render fails on a redelivery: job dead-lettered, delivery acked
/// * payload unparseable: job dead-lettered immediately, delivery acked
pub struct CaptureWorker {
    config: Config,
    broker: Arc<dyn MessageBroker>,
    renderer: Arc<dyn Renderer>,
    metrics: Arc<Metrics>,
    is_running: AtomicBool,
    received: AtomicUsize,
    acknowledged: AtomicUsize,
    requeued: AtomicUsize,
    dead_lettered: AtomicUsize,
    malformed: AtomicUsize,
}

impl CaptureWorker {
    pub fn new(
        config: Config,
        broker: Arc<dyn MessageBroker>,
        renderer: Arc<dyn Renderer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            broker,
            renderer,
            metrics,
            is_running: AtomicBool::new(false),
            received: AtomicUsize::new(0),
            acknowledged: AtomicUsize::new(0),
            requeued: AtomicUsize::new(0),
            dead_lettered: AtomicUsize::new(0),
            malformed: AtomicUsize::new(0),
        }
    }

    pub async fn declare_queues(&self) -> Result<(), PipelineError> {
        let durability = self.config.queues;

        let pending = self
            .broker
            .declare_queue(
                &self.config.input_queue,
                QueueOptions {
                    durable: durability.input,
                },
            )
            .await?;
        self.broker
            .declare_queue(
                &self.config.output_queue,
                QueueOptions {
                    durable: durability.output,
                },
            )
            .await?;
        if let Some(dead_letter) = &self.config.dead_letter_queue {
            self.broker
                .declare_queue(
                    dead_letter,
                    QueueOptions {
                        durable: durability.dead_letter,
                    },
                )
                .await?;
        }

        info!(
            "Queues declared; {} job(s) waiting on '{}'",
            pending, self.config.input_queue
        );
        Ok(())
    }

    /// Consume until the broker ends the consumer or a broker error occurs.
    pub async fn run(&self) -> Result<(), PipelineError> {
        self.run_until(std::future::pending()).await
    }

    /// Consume until `shutdown` resolves. A job already being processed is
    /// finished and resolved before the worker stops.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()> + Send,
    {
        self.declare_queues().await?;

        let mut deliveries = self
            .broker
            .consume(
                &self.config.input_queue,
                &self.config.consumer_tag,
                self.config.prefetch,
            )
            .await?;

        info!("Waiting for URLs on '{}'", self.config.input_queue);
        self.is_running.store(true, Ordering::Relaxed);
        futures::pin_mut!(shutdown);

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping consumer");
                    break Ok(());
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.handle_delivery(delivery).await {
                        error!("Worker stopping on broker failure: {}", e);
                        break Err(e);
                    }
                }
                Some(Err(e)) => {
                    error!("Consumer failed: {}", e);
                    break Err(e.into());
                }
                None => break Ok(()),
            }
        };

        self.is_running.store(false, Ordering::Relaxed);
        let stats = self.stats();
        info!(
            "Capture worker stopped. Received: {}, Acknowledged: {}, Requeued: {}, Dead-lettered: {}",
            stats.received, stats.acknowledged, stats.requeued, stats.dead_lettered
        );
        result
    }

    /// Drive one delivery from `Received` to a terminal state.
    ///
    /// Only broker failures are returned as errors. A broker failure while
    /// publishing leaves the delivery unresolved, so the broker redelivers it
    /// once the connection is gone.
    pub async fn handle_delivery(
        &self,
        delivery: Box<dyn Delivery>,
    ) -> Result<JobOutcome, PipelineError> {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_received();
        debug!(state = ?JobState::Received, redelivered = delivery.redelivered(), "Delivery received");

        let job = match Job::from_delivery(delivery.data(), delivery.redelivered()) {
            Ok(job) => job,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_malformed();
                warn!("Rejecting malformed job without retry: {}", e);

                let url = delivery.headers().get(URL_HEADER).cloned();
                self.dead_letter(
                    delivery.data(),
                    url.as_deref(),
                    DeadLetterReason::MalformedPayload,
                    &e.to_string(),
                )
                .await?;
                return self.finalize(delivery, None, JobOutcome::DeadLettered).await;
            }
        };

        debug!(state = ?JobState::Processing, url = %job.url, redelivered = job.redelivered, "Processing job");
        info!("Received URL: {}", job.url);

        let start_time = Instant::now();
        let rendered = self.renderer.render(&job.url).await;
        let elapsed = start_time.elapsed();

        match rendered {
            Ok(image_bytes) => {
                self.metrics.record_render(elapsed, Ok(image_bytes.len()));
                let capture = CaptureResult {
                    image_bytes,
                    source_url: job.url.clone(),
                };
                self.publish_capture(&capture).await?;
                info!("Screenshot taken and sent to '{}' for {}", self.config.output_queue, job.url);
                self.finalize(delivery, Some(&job.url), JobOutcome::Acknowledged)
                    .await
            }
            Err(e) => {
                self.metrics.record_render(elapsed, Err(e.kind()));
                error!(url = %job.url, redelivered = job.redelivered, "Error processing URL: {}", e);

                let outcome = failure_outcome(&job);
                if outcome == JobOutcome::DeadLettered {
                    self.dead_letter(
                        delivery.data(),
                        Some(&job.url),
                        DeadLetterReason::RenderFailed,
                        &e.to_string(),
                    )
                    .await?;
                }
                self.finalize(delivery, Some(&job.url), outcome).await
            }
        }
    }

    async fn publish_capture(&self, capture: &CaptureResult) -> Result<(), PipelineError> {
        let mut headers = MessageHeaders::new();
        headers.insert(URL_HEADER.to_string(), capture.source_url.clone());

        self.broker
            .publish(
                &self.config.output_queue,
                &capture.image_bytes,
                &headers,
                PublishOptions {
                    persistent: self.config.queues.output,
                },
            )
            .await
            .map_err(|e| e.for_job(&capture.source_url))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        payload: &[u8],
        url: Option<&str>,
        reason: DeadLetterReason,
        error: &str,
    ) -> Result<(), PipelineError> {
        let url_for_log = url.unwrap_or("<unknown>");

        let Some(queue) = &self.config.dead_letter_queue else {
            warn!(
                "No dead-letter queue configured, dropping job for {} ({})",
                url_for_log,
                reason.as_str()
            );
            return Ok(());
        };

        let mut headers = MessageHeaders::new();
        if let Some(url) = url {
            headers.insert(URL_HEADER.to_string(), url.to_string());
        }
        headers.insert(FAILURE_REASON_HEADER.to_string(), reason.as_str().to_string());
        headers.insert(ERROR_HEADER.to_string(), error.to_string());
        headers.insert(FAILED_AT_HEADER.to_string(), chrono::Utc::now().to_rfc3339());

        self.broker
            .publish(
                queue,
                payload,
                &headers,
                PublishOptions {
                    persistent: self.config.queues.dead_letter,
                },
            )
            .await
            .map_err(|e| with_job(e, url))?;

        warn!("Moved job for {} to dead-letter queue '{}'", url_for_log, queue);
        Ok(())
    }

    /// The single point where a delivery is resolved with the broker.
    async fn finalize(
        &self,
        delivery: Box<dyn Delivery>,
        url: Option<&str>,
        outcome: JobOutcome,
    ) -> Result<JobOutcome, PipelineError> {
        match outcome {
            JobOutcome::Acknowledged => {
                delivery.ack().await.map_err(|e| with_job(e, url))?;
                self.acknowledged.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Requeued => {
                delivery.nack(true).await.map_err(|e| with_job(e, url))?;
                self.requeued.fetch_add(1, Ordering::Relaxed);
                info!("Requeueing job for {}", url.unwrap_or("<unknown>"));
            }
            JobOutcome::DeadLettered => {
                delivery.ack().await.map_err(|e| with_job(e, url))?;
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.metrics.record_outcome(outcome);
        debug!(state = ?outcome.state(), url = url.unwrap_or("<unknown>"), "Job resolved");
        Ok(outcome)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            is_running: self.is_running.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }
}

fn with_job(err: BrokerError, url: Option<&str>) -> BrokerError {
    match url {
        Some(url) => err.for_job(url),
        None => err,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub is_running: bool,
    pub received: usize,
    pub acknowledged: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub malformed: usize,
}
