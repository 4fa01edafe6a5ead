//! LLM protocol types and backend trait.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    Backend, Chunk, ChunkKind, ChunkStream, FinishReason, Message, ModelRequest, Part, Role,
    StreamEvent, ToolCall, ToolOutcome, ToolResult, ToolSpec,
};
