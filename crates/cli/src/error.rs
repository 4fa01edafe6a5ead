//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine did not pass its health probe.
    #[error("engine is not healthy: {0}")]
    Unhealthy(String),

    /// Tool arguments given on the command line are not valid JSON.
    #[error("invalid tool arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// An error occurred in the tool catalog.
    #[error(transparent)]
    Catalog(#[from] catalog::Error),

    /// The tool server or admin surface failed.
    #[error(transparent)]
    Server(#[from] mcp::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<runtime::ToolError> for Error {
    fn from(e: runtime::ToolError) -> Self {
        Self::Runtime(e.into())
    }
}

impl From<runtime::AgentError> for Error {
    fn from(e: runtime::AgentError) -> Self {
        Self::Runtime(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
