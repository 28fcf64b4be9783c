//! Jobs flowing through the input queue and the artifacts produced for them.

use crate::{validate_url, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire format of a job on the input queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    pub url: String,
}

/// One URL-capture work item as delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub url: String,
    /// Set by the broker when this message was delivered before without
    /// being acknowledged.
    pub redelivered: bool,
}

impl Job {
    /// Parse a delivered payload.
    ///
    /// The payload must be a JSON object with a string `url` holding an
    /// absolute http or https URL, the same rule the job source enforces.
    pub fn from_delivery(payload: &[u8], redelivered: bool) -> Result<Self, PipelineError> {
        let parsed: JobPayload = serde_json::from_slice(payload)
            .map_err(|e| PipelineError::MalformedPayload(e.to_string()))?;

        validate_url(&parsed.url)?;

        Ok(Self {
            url: parsed.url,
            redelivered,
        })
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(&JobPayload {
            url: self.url.clone(),
        })?)
    }
}

/// Image produced for a successfully rendered job.
///
/// The source URL travels as message metadata, never inside the body.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub image_bytes: Vec<u8>,
    pub source_url: String,
}

/// Lifecycle of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    Processing,
    Acknowledged,
    Requeued,
    DeadLettered,
}

/// Terminal resolution of a delivery. Exactly one is reached per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Rendered, published and acknowledged.
    Acknowledged,
    /// First failure; rejected back onto the input queue.
    Requeued,
    /// Failed after its retry, or unparseable; removed from the input queue.
    DeadLettered,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Acknowledged => JobState::Acknowledged,
            JobOutcome::Requeued => JobState::Requeued,
            JobOutcome::DeadLettered => JobState::DeadLettered,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobOutcome::Acknowledged => "acknowledged",
            JobOutcome::Requeued => "requeued",
            JobOutcome::DeadLettered => "dead_lettered",
        };
        f.write_str(name)
    }
}

/// What to do with a job whose render failed.
///
/// A job gets exactly one retry: the first failure requeues it, any failure
/// on a redelivered job is terminal.
pub fn failure_outcome(job: &Job) -> JobOutcome {
    if job.redelivered {
        JobOutcome::DeadLettered
    } else {
        JobOutcome::Requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_and_keeps_redelivery_flag() {
        let job = Job::from_delivery(br#"{"url": "https://example.com"}"#, true).unwrap();
        assert_eq!(job.url, "https://example.com");
        assert!(job.redelivered);
    }

    #[test]
    fn extra_fields_are_ignored() {
        let job =
            Job::from_delivery(br#"{"url": "https://example.com", "priority": 3}"#, false).unwrap();
        assert_eq!(job.url, "https://example.com");
    }

    #[test]
    fn rejects_missing_or_invalid_url() {
        for payload in [
            &b"not json"[..],
            br#"{}"#,
            br#"{"url": 42}"#,
            br#"{"url": "example.com/no-scheme"}"#,
            br#"{"url": "file:///etc/passwd"}"#,
            br#"{"url": "mailto:someone@example.com"}"#,
            br#"{"url": "javascript:alert(1)"}"#,
            br#"["https://example.com"]"#,
        ] {
            assert!(
                matches!(
                    Job::from_delivery(payload, false),
                    Err(PipelineError::MalformedPayload(_))
                ),
                "payload {:?} should be malformed",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn payload_uses_url_field() {
        let job = Job {
            url: "https://example.com".into(),
            redelivered: false,
        };
        let value: serde_json::Value = serde_json::from_slice(&job.to_payload().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"url": "https://example.com"}));
    }

    #[test]
    fn one_retry_then_dead_letter() {
        let mut job = Job {
            url: "https://slow.example".into(),
            redelivered: false,
        };
        assert_eq!(failure_outcome(&job), JobOutcome::Requeued);

        job.redelivered = true;
        assert_eq!(failure_outcome(&job), JobOutcome::DeadLettered);
    }

    #[test]
    fn outcomes_map_to_terminal_states() {
        assert_eq!(JobOutcome::Acknowledged.state(), JobState::Acknowledged);
        assert_eq!(JobOutcome::Requeued.state(), JobState::Requeued);
        assert_eq!(JobOutcome::DeadLettered.state(), JobState::DeadLettered);
        assert_eq!(JobOutcome::DeadLettered.to_string(), "dead_lettered");
    }
}
