//! The set of tools exposed to the model.
//!
//! [`ToolRegistry`] binds every enabled catalog entry into a table that is
//! swapped wholesale on [`rebuild`](ToolRegistry::rebuild). Calls take a
//! snapshot of the table, so a rebuild never disturbs calls already running.
//!
//! The registry also owns the tool server: [`restart`](ToolRegistry::restart)
//! stops it, frees its port, rebuilds and starts it again.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, RwLock};

use async_trait::async_trait;
use catalog::Catalog;
use engine::Health;
use mcp::{
    CallToolResult, JsonRpcError, Notifier, PortManager, Server, ServerHandle, Tool, ToolContent,
    ToolHandler,
};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::Result;
use crate::model::{ToolCall, ToolSpec};
use crate::tools::{
    BoundTool, ContentRef, NullReporter, ToolBinder, ToolError, ToolHost, ToolOutput, ToolReporter,
};

/// Name of the built-in engine liveness tool.
pub const HEALTH_CHECK_TOOL: &str = "engine_health_check";

#[derive(Default)]
struct ToolTable {
    tools: BTreeMap<String, BoundTool>,
}

/// Bound tools plus the server that exposes them.
pub struct ToolRegistry {
    catalog: Arc<dyn Catalog>,
    binder: ToolBinder,
    table: RwLock<Arc<ToolTable>>,
    /// Held from catalog read to table swap so a stale read never lands last.
    rebuilding: SyncMutex<()>,
    addr: SocketAddr,
    ports: PortManager,
    /// The running server. Holding the lock is what serializes restarts.
    server: Mutex<Option<ServerHandle>>,
    requested: AtomicU64,
    completed: AtomicU64,
}

impl ToolRegistry {
    pub fn new(catalog: Arc<dyn Catalog>, binder: ToolBinder, addr: SocketAddr) -> Self {
        Self {
            catalog,
            binder,
            table: RwLock::new(Arc::default()),
            rebuilding: SyncMutex::new(()),
            addr,
            ports: PortManager::new().host(addr.ip()),
            server: Mutex::new(None),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn with_ports(mut self, ports: PortManager) -> Self {
        self.ports = ports;
        self
    }

    fn snapshot(&self) -> Arc<ToolTable> {
        Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Rebind every enabled tool and swap the table in one step.
    ///
    /// Definitions that fail to bind are logged and left out. Returns the
    /// number of bound tools.
    pub fn rebuild(&self) -> Result<usize> {
        let _guard = self.rebuilding.lock().unwrap_or_else(|e| e.into_inner());
        let mut table = ToolTable::default();
        for definition in self.catalog.enabled_tools()? {
            if definition.name == HEALTH_CHECK_TOOL || table.tools.contains_key(&definition.name) {
                warn!(tool = %definition.name, "duplicate tool name; skipping");
                continue;
            }
            match self.binder.bind(&definition) {
                Ok(tool) => {
                    table.tools.insert(definition.name.clone(), tool);
                }
                Err(e) => warn!(tool = %definition.name, error = %e, "skipping tool"),
            }
        }

        let count = table.tools.len();
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        info!(tools = count, "tool table rebuilt");
        Ok(count)
    }

    /// Enable or disable a catalog entry, then rebuild.
    ///
    /// A rebuild already underway finishes first, so the table this one
    /// swaps in always reflects the toggle.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<usize> {
        self.catalog.set_enabled(id, enabled)?;
        self.rebuild()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names = vec![HEALTH_CHECK_TOOL.to_string()];
        names.extend(self.snapshot().tools.keys().cloned());
        names
    }

    /// Stop the server if it runs, free the port, rebuild and start again.
    ///
    /// Requests arriving while a restart runs wait for it and are then
    /// covered by a single follow-up restart.
    pub async fn restart(self: &Arc<Self>) -> Result<SocketAddr> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.server.lock().await;
        if self.completed.load(Ordering::SeqCst) >= ticket {
            if let Some(handle) = slot.as_ref() {
                return Ok(handle.local_addr());
            }
        }
        let covers = self.requested.load(Ordering::SeqCst);

        if let Some(handle) = slot.take() {
            info!(addr = %handle.local_addr(), "stopping tool server");
            if let Err(e) = handle.shutdown().await {
                warn!(error = %e, "tool server did not stop cleanly");
            }
        }
        let port = self.addr.port();
        if !self.ports.ensure_available(port).await {
            warn!(port, "port still busy; starting anyway");
        }
        self.rebuild()?;

        let handler: Arc<dyn ToolHandler> = Arc::clone(self) as Arc<dyn ToolHandler>;
        let handle = Server::new(handler).start(self.addr).await?;
        let addr = handle.local_addr();
        *slot = Some(handle);
        self.completed.store(covers, Ordering::SeqCst);
        info!(%addr, "tool server restarted");
        Ok(addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.server.lock().await.take() {
            handle.shutdown().await?;
        }
        Ok(())
    }

    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(ServerHandle::local_addr)
    }

    /// Run one tool by name.
    pub async fn call(
        &self,
        name: &str,
        input: &Value,
        reporter: &dyn ToolReporter,
    ) -> std::result::Result<ToolOutput, ToolError> {
        if name == HEALTH_CHECK_TOOL {
            return Ok(ToolOutput::Text(self.health_report().await));
        }
        let tool = self
            .snapshot()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(input, reporter).await.map(ToolOutput::Content)
    }

    async fn health_report(&self) -> String {
        let api = self.binder.api();
        let host = api.endpoint().host().to_string();
        match api.health().await {
            Health::Healthy => format!("Engine at {host} is healthy."),
            Health::Unhealthy(detail) => format!("Engine at {host} is unhealthy: {detail}"),
            Health::Unreachable(detail) => format!("Engine at {host} is unreachable: {detail}"),
        }
    }
}

fn health_spec() -> ToolSpec {
    ToolSpec {
        name: HEALTH_CHECK_TOOL.to_string(),
        description: "Check whether the generation engine is up and answering.".to_string(),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

impl ToolHost for ToolRegistry {
    fn specs(&self) -> Vec<ToolSpec> {
        let mut specs = vec![health_spec()];
        specs.extend(self.snapshot().tools.values().map(BoundTool::spec));
        specs
    }

    async fn execute(&self, call: &ToolCall) -> std::result::Result<Value, ToolError> {
        let output = self.call(&call.name, &call.input, &NullReporter).await?;
        Ok(output.to_value())
    }
}

/// Forwards tool progress as protocol notifications.
struct NotifierReporter(Notifier);

impl ToolReporter for NotifierReporter {
    fn progress(&self, current: u64, total: Option<u64>, message: Option<&str>) {
        self.0.progress(current, total, message);
    }
}

fn resource_link(content: ContentRef) -> ToolContent {
    ToolContent::ResourceLink {
        uri: content.uri,
        name: content.filename,
        mime_type: Some(content.mime_type),
    }
}

#[async_trait]
impl ToolHandler for ToolRegistry {
    async fn list_tools(&self) -> Vec<Tool> {
        self.specs()
            .into_iter()
            .map(|spec| Tool {
                name: spec.name,
                description: Some(spec.description),
                input_schema: spec.input_schema,
            })
            .collect()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        notifier: Notifier,
    ) -> std::result::Result<CallToolResult, JsonRpcError> {
        let reporter = NotifierReporter(notifier);
        match self.call(name, &arguments, &reporter).await {
            Ok(ToolOutput::Text(text)) => Ok(CallToolResult::success(vec![ToolContent::text(text)])),
            Ok(ToolOutput::Content(contents)) => Ok(CallToolResult::success(
                contents.into_iter().map(resource_link).collect(),
            )),
            Err(ToolError::NotFound(name)) => {
                Err(JsonRpcError::invalid_params(format!("unknown tool: {name}")))
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool call failed");
                Ok(CallToolResult::error(e.to_string()))
            }
        }
    }
}
