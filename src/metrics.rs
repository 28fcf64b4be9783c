use metrics::{register_counter, register_histogram, Counter, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::{JobOutcome, PipelineError};

pub struct Metrics {
    pub jobs_received: Counter,
    pub jobs_acknowledged: Counter,
    pub jobs_requeued: Counter,
    pub jobs_dead_lettered: Counter,
    pub malformed_payloads: Counter,
    pub render_failures: Counter,
    pub render_duration: Histogram,
    pub capture_bytes: Histogram,
}

impl Metrics {
    /// Handles are no-ops until a recorder is installed.
    pub fn new() -> Self {
        Self {
            jobs_received: register_counter!("capture_jobs_received_total"),
            jobs_acknowledged: register_counter!("capture_jobs_acknowledged_total"),
            jobs_requeued: register_counter!("capture_jobs_requeued_total"),
            jobs_dead_lettered: register_counter!("capture_jobs_dead_lettered_total"),
            malformed_payloads: register_counter!("capture_malformed_payloads_total"),
            render_failures: register_counter!("capture_render_failures_total"),
            render_duration: register_histogram!("capture_render_duration_seconds"),
            capture_bytes: register_histogram!("capture_image_bytes"),
        }
    }

    pub fn record_received(&self) {
        self.jobs_received.increment(1);
    }

    pub fn record_render(&self, duration: Duration, result: Result<usize, &str>) {
        self.render_duration.record(duration.as_secs_f64());

        match result {
            Ok(bytes) => self.capture_bytes.record(bytes as f64),
            Err(kind) => {
                self.render_failures.increment(1);
                metrics::increment_counter!("capture_render_failures_by_kind_total", "kind" => kind.to_string());
            }
        }
    }

    pub fn record_malformed(&self) {
        self.malformed_payloads.increment(1);
    }

    pub fn record_outcome(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Acknowledged => self.jobs_acknowledged.increment(1),
            JobOutcome::Requeued => self.jobs_requeued.increment(1),
            JobOutcome::DeadLettered => self.jobs_dead_lettered.increment(1),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder with a scrape endpoint on `port`.
///
/// Must be called before [`Metrics::new`] for the handles to report anywhere.
pub fn install_prometheus_exporter(port: u16) -> Result<(), PipelineError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| PipelineError::Config(format!("Failed to start metrics exporter: {e}")))?;

    info!("Serving Prometheus metrics on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_harmless() {
        let metrics = Metrics::new();
        metrics.record_received();
        metrics.record_render(Duration::from_millis(1200), Ok(48_213));
        metrics.record_render(Duration::from_secs(60), Err("navigation_timeout"));
        metrics.record_malformed();
        metrics.record_outcome(JobOutcome::Requeued);
        metrics.record_outcome(JobOutcome::DeadLettered);
    }
}
