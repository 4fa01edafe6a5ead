use engine::JobError;
use thiserror::Error;

/// Why a tool definition could not be bound.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum BindError {
    #[error("tool '{tool}': {reason}")]
    InvalidTemplate { tool: String, reason: String },

    #[error("parameter '{parameter}': path '{path}' {reason}")]
    InvalidPath {
        parameter: String,
        path: String,
        reason: String,
    },

    #[error("parameter '{0}': minimum is greater than maximum")]
    InvertedBounds(String),

    #[error("parameter '{0}' is declared twice")]
    DuplicateParameter(String),

    #[error("parameter '{parameter}': bad default value: {reason}")]
    InvalidDefault { parameter: String, reason: String },
}

/// Errors that can occur during tool execution.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("job produced no usable artifacts")]
    NoArtifactsProduced,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("execution failed: {0}")]
    Execution(String),
}
