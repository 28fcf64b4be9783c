//! # Capture Pipeline
//!
//! A queue-driven web page capture worker. URL jobs arrive on an input queue,
//! each one is rendered in a fresh headless Chrome, and the full-page PNG is
//! published to an output queue with the originating URL in the `url` header.
//!
//! ## Job lifecycle
//!
//! The broker delivers at least once, never exactly once. The worker holds at
//! most one unacknowledged delivery and resolves each one exactly once:
//!
//! | Render result | Redelivered | Resolution |
//! |---------------|-------------|------------|
//! | Success | any | publish image, ack |
//! | Failure | no | nack with requeue |
//! | Failure | yes | publish to dead-letter queue, ack |
//! | Unparseable payload | any | publish to dead-letter queue, ack |
//!
//! A job is therefore retried at most once, tracked purely through the
//! broker's redelivery flag.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_pipeline::{
//!     AmqpBroker, CaptureWorker, ChromeLauncher, Config, Metrics, PageRenderer,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let broker = Arc::new(AmqpBroker::connect(&config.broker_url).await?);
//!     let renderer = PageRenderer::new(
//!         ChromeLauncher::new(config.clone()),
//!         config.navigation_timeout,
//!     );
//!
//!     let worker = CaptureWorker::new(
//!         config,
//!         broker,
//!         Arc::new(renderer),
//!         Arc::new(Metrics::new()),
//!     );
//!     worker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! capture-pipeline worker
//! capture-pipeline enqueue https://example.com --file urls.txt
//! capture-pipeline capture --url https://example.com --output example.png
//! capture-pipeline depth --queue url_queue.dead_letter
//! ```

/// Configuration and settings for the pipeline
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Jobs, capture results and the job lifecycle states
pub mod job;

/// Broker abstraction with RabbitMQ and in-memory implementations
pub mod broker;

/// The render operation and its rendering-context seams
pub mod render;

/// Headless Chrome rendering contexts
pub mod browser;

/// Capture worker driving deliveries through their lifecycle
pub mod worker;

/// Job source for the input queue
pub mod producer;

/// Command-line interface implementation
pub mod cli;

/// Metrics collection and the Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use crate::metrics::{install_prometheus_exporter, Metrics};
pub use broker::{AmqpBroker, Delivery, DeliveryStream, MemoryBroker, MessageBroker};
pub use browser::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use job::*;
pub use producer::*;
pub use render::*;
pub use utils::*;
pub use worker::*;
