//! MCP (Model Context Protocol) tool server.
//!
//! Serves a [`ToolHandler`] over streamable HTTP at `POST /mcp` and keeps its
//! listening port recoverable through [`PortManager`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp::{Server, ToolHandler};
//!
//! # async fn example(tools: Arc<dyn ToolHandler>) -> mcp::Result<()> {
//! let server = Server::new(tools).start("127.0.0.1:3001".parse().unwrap()).await?;
//! // ...
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod port;
mod protocol;
mod server;

pub use error::{Error, Result};
pub use port::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT, PortManager, ProcessControl, SystemProcesses};
pub use protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, LATEST_PROTOCOL_VERSION, ListToolsResult,
    RequestId, RequestMeta, Tool, ToolContent, codes,
};
pub use server::{DEFAULT_SHUTDOWN_GRACE, Notifier, Server, ServerHandle, ToolHandler};
