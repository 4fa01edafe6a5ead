use thiserror::Error;

/// Errors from a model provider.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// The request never got a response.
    #[error("network: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The response or stream did not have the expected shape.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}
