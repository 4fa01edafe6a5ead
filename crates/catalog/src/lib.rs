//! Tool catalog for Atelier.
//!
//! The catalog stores the user-defined tools the tool server exposes: each
//! [`ToolDefinition`] is a workflow template plus the [`ParameterSpec`]s that
//! say where caller-supplied values go inside it.
//!
//! The runtime only ever reads the catalog through the [`Catalog`] trait,
//! which has two implementations:
//!
//! - [`SqliteCatalog`]: persistent, used by the `atelier` binary.
//! - [`MemoryCatalog`]: in-process, handy for tests and embedding.
//!
//! # Example
//!
//! ```no_run
//! use catalog::{Catalog, DataType, ParameterSpec, SqliteCatalog, ToolDefinition};
//! use serde_json::json;
//!
//! let catalog = SqliteCatalog::open("atelier.db")?;
//! let tool = ToolDefinition::new("portrait", json!({"3": {"inputs": {"steps": 20}}}))
//!     .with_parameter(ParameterSpec::new("steps", DataType::Integer, "3.inputs.steps"));
//! catalog.upsert(&tool)?;
//!
//! for tool in catalog.enabled_tools()? {
//!     println!("{}: {} parameters", tool.name, tool.parameters.len());
//! }
//! # Ok::<(), catalog::Error>(())
//! ```

mod error;
mod store;
mod tool;

use std::sync::RwLock;

pub use error::{Error, Result};
pub use store::{SqliteCatalog, ToolSummary};
pub use tool::{DataType, ParameterSpec, RandomBitWidth, ToolDefinition};

/// Read access to stored tools, plus the enable switch.
pub trait Catalog: Send + Sync {
    /// All enabled tools with their parameters.
    fn enabled_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Enable or disable one tool by id.
    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()>;
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tools: RwLock<Vec<ToolDefinition>>,
}

impl MemoryCatalog {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools: RwLock::new(tools),
        }
    }

    /// Add or replace a tool (matched by id).
    pub fn upsert(&self, tool: ToolDefinition) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        match tools.iter_mut().find(|t| t.id == tool.id) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
    }
}

impl Catalog for MemoryCatalog {
    fn enabled_tools(&self) -> Result<Vec<ToolDefinition>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        Ok(tools.iter().filter(|t| t.enabled).cloned().collect())
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let tool = tools
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        tool.enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_catalog_toggles() {
        let tool = ToolDefinition::new("a", json!({}));
        let id = tool.id.clone();
        let catalog = MemoryCatalog::new(vec![tool]);

        catalog.set_enabled(&id, false).unwrap();
        assert!(catalog.enabled_tools().unwrap().is_empty());

        catalog.set_enabled(&id, true).unwrap();
        assert_eq!(catalog.enabled_tools().unwrap().len(), 1);
    }

    #[test]
    fn memory_catalog_upsert_replaces() {
        let mut tool = ToolDefinition::new("a", json!({}));
        let catalog = MemoryCatalog::new(vec![tool.clone()]);
        tool.name = "b".into();
        catalog.upsert(tool);
        let tools = catalog.enabled_tools().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "b");
    }
}
