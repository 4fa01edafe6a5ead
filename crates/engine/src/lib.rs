//! Generation engine client.
//!
//! Jobs are queued with `POST /prompt` and followed over a WebSocket event
//! channel until the engine reports a terminal event. See [`JobClient`].

pub mod channel;
pub mod error;
pub mod event;
pub mod http;
pub mod job;
pub mod sink;
pub mod ws;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use channel::{ChannelEvent, Connector, EventChannel, Frame, ListenerId, Listeners, Transport};
pub use error::{JobError, Result, SinkError, TransportError};
pub use event::{Artifact, EngineEvent, EventKind, ExecutedData, NodeOutput, ProgressData};
pub use http::{
    DEFAULT_HEALTH_TIMEOUT, DEFAULT_SUBMIT_TIMEOUT, EngineApi, EngineEndpoint, Health, HttpEngine,
};
pub use job::{DEFAULT_JOB_TIMEOUT, JobClient, JobPhase, JobResult};
pub use sink::{ArtifactSink, HttpUploadSink, PassThroughSink, mime_type};
pub use ws::WsConnector;
