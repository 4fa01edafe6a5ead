//! MCP tool server over streamable HTTP.
//!
//! Every JSON-RPC message is a `POST /mcp`. Plain calls get a JSON response.
//! A `tools/call` that carries a progress token from a client accepting
//! `text/event-stream` is answered as an SSE stream: progress notifications
//! first, the call result last.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, Tool,
};

/// How long `shutdown` waits for in-flight requests before detaching them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The tools a server exposes.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn list_tools(&self) -> Vec<Tool>;

    /// Run a tool. Tool failures belong in an `is_error` result; `Err` is
    /// reserved for protocol errors such as an unknown tool name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        notifier: Notifier,
    ) -> std::result::Result<CallToolResult, JsonRpcError>;
}

/// Sends `notifications/progress` for one call. Inert when the client did
/// not ask for progress.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    channel: Option<(Value, mpsc::UnboundedSender<Value>)>,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A notifier pushing into `tx` under `token`.
    pub fn new(token: Value, tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            channel: Some((token, tx)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    pub fn progress(&self, progress: u64, total: Option<u64>, message: Option<&str>) {
        let Some((token, tx)) = &self.channel else {
            return;
        };
        let mut params = json!({"progressToken": token, "progress": progress});
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        if let Some(message) = message {
            params["message"] = json!(message);
        }
        // The client may have gone away.
        let _ = tx.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": params,
        }));
    }
}

struct AppState {
    handler: Arc<dyn ToolHandler>,
    info: Implementation,
}

/// An MCP server, ready to start.
pub struct Server {
    handler: Arc<dyn ToolHandler>,
    info: Implementation,
    shutdown_grace: Duration,
}

impl Server {
    pub fn new(handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            handler,
            info: Implementation {
                name: "atelier".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.info = Implementation {
            name: name.into(),
            version: Some(version.into()),
        };
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            handler: Arc::clone(&self.handler),
            info: self.info.clone(),
        });
        Router::new()
            .route("/mcp", post(handle_rpc))
            .with_state(state)
    }

    /// Bind `addr` and serve in the background.
    pub async fn start(self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        info!(addr = %local_addr, "MCP server listening");

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
            grace: self.shutdown_grace,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    grace: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests, up to the
    /// shutdown grace period.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match tokio::time::timeout(self.grace, self.task).await {
            Ok(Ok(served)) => {
                info!(addr = %self.local_addr, "MCP server stopped");
                served.map_err(Error::Serve)
            }
            Ok(Err(e)) => Err(Error::Task(e.to_string())),
            Err(_) => {
                warn!(addr = %self.local_addr, "MCP server still draining; detaching");
                Ok(())
            }
        }
    }
}

async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return reply(JsonRpcResponse::failure(None, JsonRpcError::parse_error(e))),
    };
    if request.jsonrpc != "2.0" {
        let error = JsonRpcError::invalid_request("jsonrpc must be \"2.0\"");
        return reply(JsonRpcResponse::failure(request.id, error));
    }
    let Some(method) = request.method.clone() else {
        let error = JsonRpcError::invalid_request("missing method");
        return reply(JsonRpcResponse::failure(request.id, error));
    };
    if request.is_notification() {
        debug!(method, "notification received");
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id;
    if method == "tools/call" && accepts_event_stream(&headers) {
        let token = request
            .params
            .as_ref()
            .and_then(|p| p.pointer("/_meta/progressToken"))
            .cloned();
        if let Some(token) = token {
            return stream_call(state, id, request.params, token);
        }
    }

    let response = respond(&state, id, &method, request.params, Notifier::disabled()).await;
    reply(response)
}

fn reply(response: JsonRpcResponse) -> Response {
    Json(response).into_response()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

fn stream_call(
    state: Arc<AppState>,
    id: Option<RequestId>,
    params: Option<Value>,
    token: Value,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let notifier = Notifier::new(token, tx.clone());
    tokio::spawn(async move {
        let response = respond(&state, id, "tools/call", params, notifier).await;
        match serde_json::to_value(response) {
            Ok(message) => {
                let _ = tx.send(message);
            }
            Err(e) => warn!(error = %e, "failed to encode streamed response"),
        }
    });

    let events = futures::stream::unfold(rx, |mut rx| async move {
        let message = rx.recv().await?;
        let event = Event::default().event("message").data(message.to_string());
        Some((Ok::<_, Infallible>(event), rx))
    });
    Sse::new(events).into_response()
}

async fn respond(
    state: &AppState,
    id: Option<RequestId>,
    method: &str,
    params: Option<Value>,
    notifier: Notifier,
) -> JsonRpcResponse {
    match dispatch(state, method, params, notifier).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => {
            debug!(method, error = %error, "request failed");
            JsonRpcResponse::failure(id, error)
        }
    }
}

async fn dispatch(
    state: &AppState,
    method: &str,
    params: Option<Value>,
    notifier: Notifier,
) -> std::result::Result<Value, JsonRpcError> {
    match method {
        "initialize" => {
            let params: InitializeParams = match params {
                Some(params) => parse(params)?,
                None => InitializeParams::default(),
            };
            if let Some(client) = &params.client_info {
                info!(client = %client.name, "client initializing");
            }
            encode(InitializeResult::negotiate(&params, state.info.clone()))
        }
        "ping" => Ok(json!({})),
        "tools/list" => encode(ListToolsResult {
            tools: state.handler.list_tools().await,
        }),
        "tools/call" => {
            let params: CallToolParams =
                parse(params.ok_or_else(|| JsonRpcError::invalid_params("missing params"))?)?;
            let arguments = params.arguments.unwrap_or_else(|| json!({}));
            debug!(tool = %params.name, "tool call");
            let result = state
                .handler
                .call_tool(&params.name, arguments, notifier)
                .await?;
            encode(result)
        }
        other => Err(JsonRpcError::method_not_found(other)),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn encode<T: Serialize>(value: T) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}
