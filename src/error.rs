use std::time::Duration;
use thiserror::Error;

/// Failure of a single render operation.
///
/// The worker does not distinguish between variants when deciding what to do
/// with a job; every variant is a "render failed" outcome. The variants exist
/// for logging and metrics labels.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationError(String),

    #[error("Capture failed: {0}")]
    CaptureError(String),

    #[error("Rendering context launch failed: {0}")]
    LaunchFailed(String),
}

impl RenderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::NavigationTimeout(_) => "navigation_timeout",
            RenderError::NavigationError(_) => "navigation_error",
            RenderError::CaptureError(_) => "capture_error",
            RenderError::LaunchFailed(_) => "launch_failed",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Delivery resolution failed: {0}")]
    Ack(String),
}

impl BrokerError {
    /// Prefix the message with the URL of the job being handled.
    pub fn for_job(self, url: &str) -> Self {
        match self {
            BrokerError::Connection(msg) => BrokerError::Connection(format!("{url}: {msg}")),
            BrokerError::Channel(msg) => BrokerError::Channel(format!("{url}: {msg}")),
            BrokerError::Publish(msg) => BrokerError::Publish(format!("{url}: {msg}")),
            BrokerError::Ack(msg) => BrokerError::Ack(format!("{url}: {msg}")),
        }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerError::Connection(err.to_string())
            }
            _ => BrokerError::Channel(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}
