//! Engine error types.

use std::time::Duration;
use thiserror::Error;

/// Terminal failures of a generation job.
///
/// Every job resolves to exactly one `JobResult` or exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum JobError {
    #[error("engine host is required")]
    MissingHost,

    #[error("client id is required")]
    MissingClientId,

    #[error("job payload is required")]
    MissingPayload,

    #[error("job client is already closed")]
    AlreadyClosed,

    #[error("engine API call failed: {0}")]
    ApiCallFailed(String),

    #[error("invalid response from engine API: {0}")]
    InvalidApiResponse(String),

    #[error("engine timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invalid executed event data")]
    InvalidExecutedData,

    #[error("engine error: {0}")]
    ExecutionError(String),

    #[error("event channel error: {0}")]
    TransportError(String),

    #[error("event channel closed unexpectedly")]
    UnexpectedClose,
}

impl From<TransportError> for JobError {
    fn from(err: TransportError) -> Self {
        Self::TransportError(err.to_string())
    }
}

/// Failures of the duplex event channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("close failed: {0}")]
    Close(String),
}

/// Failures while turning an artifact into a stable reference.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact download failed: {0}")]
    Download(String),

    #[error("artifact upload failed: {0}")]
    Upload(String),
}

pub type Result<T> = std::result::Result<T, JobError>;
