//! Workflow tools: binding definitions, substituting parameters, running jobs.

mod binder;
mod empty;
pub mod errors;
mod params;
mod template;
mod r#trait;
mod types;

pub use binder::{BoundTool, DEFAULT_ARTIFACT_CONCURRENCY, ToolBinder};
pub use empty::EmptyToolHost;
pub use errors::{BindError, ToolError};
pub use params::{coerce, input_schema};
pub use template::TemplatePath;
pub use r#trait::{NullReporter, ToolHost, ToolReporter};
pub use types::{ContentRef, ToolOutput};
