//! Tool host and progress reporting traits.

use crate::model::{ToolCall, ToolSpec};
use crate::tools::{ContentRef, ToolError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Trait for tool execution hosts.
///
/// Implementations provide tool specifications and execute tool calls.
/// This is the boundary between the model loop and side effects.
pub trait ToolHost: Send + Sync {
    /// Get available tool specifications.
    fn specs(&self) -> Vec<ToolSpec>;

    /// Execute a tool call.
    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<Value, ToolError>> + Send;
}

impl<T: ToolHost> ToolHost for Arc<T> {
    fn specs(&self) -> Vec<ToolSpec> {
        (**self).specs()
    }

    fn execute(&self, call: &ToolCall) -> impl Future<Output = Result<Value, ToolError>> + Send {
        (**self).execute(call)
    }
}

/// Receives progress and results while a tool runs.
pub trait ToolReporter: Send + Sync {
    fn progress(&self, _current: u64, _total: Option<u64>, _message: Option<&str>) {}

    /// Called once per resolved artifact, in artifact order.
    fn content(&self, _content: &ContentRef) {}
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl ToolReporter for NullReporter {}
