//! HTTP side channel to the engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::JobError;
use crate::event::Artifact;

/// Default timeout for `POST /prompt`.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the `/system_stats` liveness probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of a generation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    host: String,
    secure: bool,
}

impl EngineEndpoint {
    /// `host` is `name:port` without a scheme.
    pub fn new(host: impl Into<String>, secure: bool) -> Result<Self, JobError> {
        let host = host.into().trim().trim_end_matches('/').to_string();
        if host.is_empty() {
            return Err(JobError::MissingHost);
        }
        Ok(Self { host, secure })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn fixed(host: &str) -> Self {
        Self {
            host: host.to_string(),
            secure: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{path}", self.host)
    }

    /// Event channel URL for one client.
    pub fn ws_url(&self, client_id: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}/ws?clientId={}",
            self.host,
            urlencoding::encode(client_id)
        )
    }

    /// Download URL of a produced artifact.
    pub fn view_url(&self, artifact: &Artifact) -> String {
        let kind = if artifact.kind.is_empty() {
            "output"
        } else {
            artifact.kind.as_str()
        };
        self.http_url(&format!(
            "/view?filename={}&subfolder={}&type={}",
            urlencoding::encode(&artifact.filename),
            urlencoding::encode(&artifact.subfolder),
            urlencoding::encode(kind)
        ))
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// The engine answered with a non-2xx status.
    Unhealthy(String),
    Unreachable(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Request/response calls to the engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    fn endpoint(&self) -> &EngineEndpoint;

    /// Queue a workflow. Returns the engine's job id.
    async fn submit(&self, client_id: &str, payload: &Value) -> Result<String, JobError>;

    async fn health(&self) -> Health;
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    client_id: &'a str,
    prompt: &'a Value,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    prompt_id: Option<String>,
}

/// reqwest-backed [`EngineApi`].
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: reqwest::Client,
    endpoint: EngineEndpoint,
    submit_timeout: Duration,
    health_timeout: Duration,
}

impl HttpEngine {
    pub fn new(endpoint: EngineEndpoint) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }
}

#[async_trait]
impl EngineApi for HttpEngine {
    fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    async fn submit(&self, client_id: &str, payload: &Value) -> Result<String, JobError> {
        let url = self.endpoint.http_url("/prompt");
        let response = self
            .client
            .post(&url)
            .timeout(self.submit_timeout)
            .json(&SubmitRequest {
                client_id,
                prompt: payload,
            })
            .send()
            .await
            .map_err(|e| JobError::ApiCallFailed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(JobError::ApiCallFailed(format!("status {status}: {body}")));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| JobError::InvalidApiResponse(e.to_string()))?;
        let prompt_id = body
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobError::InvalidApiResponse("missing prompt_id".into()))?;
        debug!(client_id, prompt_id, "workflow queued");
        Ok(prompt_id)
    }

    async fn health(&self) -> Health {
        let url = self.endpoint.http_url("/system_stats");
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Health::Healthy,
            Ok(response) => Health::Unhealthy(response.status().to_string()),
            Err(e) => Health::Unreachable(e.to_string()),
        }
    }
}
