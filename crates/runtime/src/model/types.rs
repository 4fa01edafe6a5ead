use super::errors::ModelError;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Outcome of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { output: Value },
    Error { message: String },
}

/// A finished tool call: the call itself plus what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call: ToolCall,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: ToolCall, output: Value) -> Self {
        Self {
            call,
            outcome: ToolOutcome::Success { output },
        }
    }

    pub fn error(call: ToolCall, message: impl Into<String>) -> Self {
        Self {
            call,
            outcome: ToolOutcome::Error {
                message: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error { .. })
    }

    /// Output rendered as text for providers that want a string.
    pub fn output_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success {
                output: Value::String(text),
            } => text.clone(),
            ToolOutcome::Success { output } => output.to_string(),
            ToolOutcome::Error { message } => message.clone(),
        }
    }
}

/// A part of a message, which can be text or a tool interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    ToolCall(ToolCall),
    /// A result available to the model on its next call.
    ToolResult(ToolResult),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A message, consisting of a role and one or more parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn from_parts(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Get combined text content from all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls from this message.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

/// A tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Why the model stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// The model wants its tool calls answered.
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other(String),
}

/// One streamed piece of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    TextDelta(String),
    ReasoningDelta(String),
    Source {
        url: String,
        title: Option<String>,
    },
    ToolInputStart {
        id: String,
        name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    /// A complete tool call. `provider_executed` calls were already run by
    /// the provider and are followed by their own `ToolResult` chunk.
    ToolCall {
        call: ToolCall,
        provider_executed: bool,
    },
    ToolResult(ToolResult),
    /// Provider data with no dedicated variant.
    Raw(Value),
}

/// Coarse chunk classification used to segment output into spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Text,
    Reasoning,
    Source,
    ToolInput,
    ToolCall,
    ToolResult,
    Raw,
}

impl Chunk {
    pub fn kind(&self) -> ChunkKind {
        match self {
            Self::TextDelta(_) => ChunkKind::Text,
            Self::ReasoningDelta(_) => ChunkKind::Reasoning,
            Self::Source { .. } => ChunkKind::Source,
            Self::ToolInputStart { .. } | Self::ToolInputDelta { .. } => ChunkKind::ToolInput,
            Self::ToolCall { .. } => ChunkKind::ToolCall,
            Self::ToolResult(_) => ChunkKind::ToolResult,
            Self::Raw(_) => ChunkKind::Raw,
        }
    }
}

/// Item of a model output stream. A well-formed stream ends with `Finish`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(Chunk),
    Finish(FinishReason),
}

pub type ChunkStream = BoxStream<'static, Result<StreamEvent, ModelError>>;

/// Everything needed for one model step.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    /// Tool round-trips the provider may run on its own before returning.
    pub max_steps: u32,
}

/// Trait for LLM provider backends.
pub trait Backend: Send + Sync {
    /// Stream the model's output for one step.
    fn stream(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<ChunkStream, ModelError>> + Send;

    /// Turn a tool result into a message the next call can replay.
    fn replay_part(&self, result: &ToolResult) -> Message {
        Message::from_parts(
            Role::Assistant,
            vec![
                Part::ToolCall(result.call.clone()),
                Part::ToolResult(result.clone()),
            ],
        )
    }
}
