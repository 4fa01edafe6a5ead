use thiserror::Error;

use crate::model::ModelError;
use crate::tools::{BindError, ToolError};

/// Why an agent run ended without a final answer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model finished with an error")]
    ModelFinishedWithError,

    #[error("no final answer after {0} iterations")]
    MaxIterationsExceeded(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] catalog::Error),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("tool server: {0}")]
    Server(#[from] mcp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
