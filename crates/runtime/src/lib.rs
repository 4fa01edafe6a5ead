//! Atelier runtime: workflow tools and the model/tool loop.
//!
//! # Overview
//!
//! - **ToolBinder** turns a catalog [`ToolDefinition`](catalog::ToolDefinition)
//!   into a [`BoundTool`]: an input schema, a validator that coerces and
//!   clamps caller values, and an executor that substitutes them into a copy
//!   of the workflow template and runs it on the engine.
//! - **ToolRegistry** holds the bound tools of every enabled definition and
//!   serves them over MCP, rebuilding the whole set on restart.
//! - **Agent** streams model output, runs the tool calls it contains and
//!   feeds the results back until the model stops.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use catalog::SqliteCatalog;
//! use engine::{EngineEndpoint, HttpEngine, WsConnector};
//! use runtime::{ToolBinder, ToolRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = EngineEndpoint::new("127.0.0.1:8188", false)?;
//! let binder = ToolBinder::new(
//!     Arc::new(HttpEngine::new(endpoint)),
//!     Arc::new(WsConnector),
//! );
//! let catalog = Arc::new(SqliteCatalog::open("atelier.db")?);
//! let registry = Arc::new(ToolRegistry::new(catalog, binder, "127.0.0.1:3001".parse()?));
//! let addr = registry.restart().await?;
//! println!("serving tools on {addr}");
//! # Ok(())
//! # }
//! ```

mod agent;
mod error;
pub mod model;
pub mod providers;
mod registry;
pub mod tools;

pub use agent::{
    Agent, AgentObserver, ConversationState, DEFAULT_MAX_ITERATIONS, RunOutcome,
};
pub use error::{AgentError, Error, Result};
pub use model::{Backend, Message, ModelError};
pub use providers::{AnthropicBackend, AnthropicBackendBuilder};
pub use registry::{HEALTH_CHECK_TOOL, ToolRegistry};
pub use tools::{
    BindError, BoundTool, ContentRef, NullReporter, ToolBinder, ToolError, ToolHost, ToolOutput,
    ToolReporter,
};
