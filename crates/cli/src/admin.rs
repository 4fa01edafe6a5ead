//! Admin HTTP surface for a running `atelier serve`.
//!
//! - `PUT /mcp/restart`: rebuild the tool set and restart the tool server.
//! - `PUT /tools/{id}/enabled`: enable or disable one catalog entry.
//! - `GET /health`: tool server address and the exposed tool names.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use runtime::ToolRegistry;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

type Reply = (StatusCode, Json<Value>);

pub fn router(registry: Arc<ToolRegistry>) -> Router {
    Router::new()
        .route("/mcp/restart", put(restart))
        .route("/tools/{id}/enabled", put(set_enabled))
        .route("/health", get(health))
        .with_state(registry)
}

async fn restart(State(registry): State<Arc<ToolRegistry>>) -> Reply {
    info!("restart requested");
    match registry.restart().await {
        Ok(addr) => (
            StatusCode::OK,
            Json(json!({
                "status": "restarted",
                "addr": addr.to_string(),
                "tools": registry.tool_names(),
            })),
        ),
        Err(e) => {
            error!(error = %e, "restart failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_enabled(
    State(registry): State<Arc<ToolRegistry>>,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Reply {
    match registry.set_enabled(&id, body.enabled) {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({"id": id, "enabled": body.enabled, "tools": count})),
        ),
        Err(runtime::Error::Catalog(catalog::Error::NotFound(id))) => failure(
            StatusCode::NOT_FOUND,
            format!("no tool with id '{id}'"),
        ),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn health(State(registry): State<Arc<ToolRegistry>>) -> Reply {
    let addr = registry.server_addr().await.map(|addr| addr.to_string());
    (
        StatusCode::OK,
        Json(json!({
            "server": addr,
            "tools": registry.tool_names(),
        })),
    )
}

fn failure(status: StatusCode, error: impl std::fmt::Display) -> Reply {
    (status, Json(json!({"error": error.to_string()})))
}
