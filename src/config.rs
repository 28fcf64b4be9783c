//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the capture pipeline:
//! broker address and queue names, queue durability, the navigation deadline
//! and network-idle heuristic of the render operation, and browser settings.

use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the capture pipeline
///
/// # Examples
///
/// ```rust
/// use capture_pipeline::Config;
///
/// let config = Config {
///     broker_url: "amqp://rabbit:5672/%2f".to_string(),
///     ..Default::default()
/// };
/// assert_eq!(config.input_queue, "url_queue");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// AMQP address of the broker (default: `amqp://localhost:5672/%2f`)
    pub broker_url: String,

    /// Queue the worker consumes URL jobs from (default: `url_queue`)
    pub input_queue: String,

    /// Queue captured images are published to (default: `screenshot_queue`)
    pub output_queue: String,

    /// Queue jobs are routed to once they exhaust their single retry
    ///
    /// `None` drops such jobs after logging them.
    pub dead_letter_queue: Option<String>,

    /// Durability of each declared queue
    pub queues: QueueDurability,

    /// Maximum unacknowledged deliveries handed to the worker (must be 1)
    pub prefetch: u16,

    /// Deadline for the navigate-and-settle phase of a render (default: 60 seconds)
    pub navigation_timeout: Duration,

    /// When a page counts as loaded
    pub network_idle: NetworkIdleSettings,

    /// Browser viewport used for every rendering context
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads
    pub user_agent: Option<String>,

    /// Consumer tag announced to the broker
    pub consumer_tag: String,

    /// Port for the Prometheus scrape endpoint; disabled when `None`
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "amqp://localhost:5672/%2f".to_string(),
            input_queue: "url_queue".to_string(),
            output_queue: "screenshot_queue".to_string(),
            dead_letter_queue: Some("url_queue.dead_letter".to_string()),
            queues: QueueDurability::default(),
            prefetch: 1,
            navigation_timeout: Duration::from_secs(60),
            network_idle: NetworkIdleSettings::default(),
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: None,
            consumer_tag: "capture-worker".to_string(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.broker_url.trim().is_empty() {
            return Err(PipelineError::Config("Broker URL must not be empty".into()));
        }

        if self.input_queue.is_empty() || self.output_queue.is_empty() {
            return Err(PipelineError::Config("Queue names must not be empty".into()));
        }

        if self.input_queue == self.output_queue {
            return Err(PipelineError::Config(
                "Input and output queue must differ".into(),
            ));
        }

        if let Some(dead_letter) = &self.dead_letter_queue {
            if dead_letter.is_empty() || *dead_letter == self.input_queue {
                return Err(PipelineError::Config(format!(
                    "Dead-letter queue '{dead_letter}' must be non-empty and differ from the input queue"
                )));
            }
        }

        if self.prefetch != 1 {
            return Err(PipelineError::Config(format!(
                "Prefetch must be 1, got {}",
                self.prefetch
            )));
        }

        if self.navigation_timeout.is_zero() {
            return Err(PipelineError::Config(
                "Navigation timeout must be greater than 0".into(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(PipelineError::Config(
                "Viewport dimensions must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Durability of the declared queues
///
/// All three default to durable so that jobs and results survive a broker
/// restart the same way.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueDurability {
    pub input: bool,
    pub output: bool,
    pub dead_letter: bool,
}

impl Default for QueueDurability {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
            dead_letter: true,
        }
    }
}

/// Network-idle heuristic used to decide a page has finished loading
///
/// The page is considered loaded once at most `max_inflight` requests have
/// been outstanding for a continuous `idle_window`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkIdleSettings {
    /// Tolerated number of in-flight requests (default: 0)
    pub max_inflight: usize,

    /// Settling window (default: 500ms)
    pub idle_window: Duration,
}

impl Default for NetworkIdleSettings {
    fn default() -> Self {
        Self {
            max_inflight: 0,
            idle_window: Duration::from_millis(500),
        }
    }
}

/// Browser viewport configuration for captures
///
/// # Examples
///
/// ```rust
/// use capture_pipeline::Viewport;
///
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.mobile);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.input_queue, "url_queue");
        assert_eq!(config.output_queue, "screenshot_queue");
        assert_eq!(config.dead_letter_queue.as_deref(), Some("url_queue.dead_letter"));
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.navigation_timeout, Duration::from_secs(60));
        assert!(config.queues.input && config.queues.output && config.queues.dead_letter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"broker_url": "amqp://rabbit/%2f", "dead_letter_queue": null}"#)
                .unwrap();
        assert_eq!(config.broker_url, "amqp://rabbit/%2f");
        assert_eq!(config.input_queue, "url_queue");
        assert!(config.dead_letter_queue.is_none());
        assert_eq!(config.network_idle, NetworkIdleSettings::default());
    }

    #[test]
    fn test_validate_rejects_prefetch_other_than_one() {
        let config = Config {
            prefetch: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_queue_collisions() {
        let same_queues = Config {
            output_queue: "url_queue".to_string(),
            ..Default::default()
        };
        assert!(same_queues.validate().is_err());

        let dead_letter_is_input = Config {
            dead_letter_queue: Some("url_queue".to_string()),
            ..Default::default()
        };
        assert!(dead_letter_is_input.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_viewport() {
        let no_timeout = Config {
            navigation_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());

        let no_width = Config {
            viewport: Viewport {
                width: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(no_width.validate().is_err());
    }

    #[tokio::test]
    async fn test_from_file_reports_missing_file() {
        let result = Config::from_file("/nonexistent/capture-pipeline.json").await;
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }
}
