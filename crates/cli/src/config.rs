//! Configuration loading from atelier.toml.
//!
//! Values come from the TOML file first, then from environment variables,
//! which win. The result is resolved once in `main` and handed to whatever
//! needs it.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use engine::{ArtifactSink, EngineEndpoint, HttpEngine, HttpUploadSink, PassThroughSink};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "atelier.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub upload: UploadConfig,
    pub agent: AgentConfig,
    pub model: ModelConfig,
}

/// Generation engine connection.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `host:port` without a scheme. Required.
    pub host: Option<String>,
    /// Use https/wss instead of http/ws.
    pub secure: bool,
    /// Hard limit for one job, from channel open to terminal event.
    pub timeout_secs: u64,
    pub submit_timeout_secs: u64,
    pub health_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            secure: false,
            timeout_secs: 600,
            submit_timeout_secs: 30,
            health_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Tool server port.
    pub port: u16,
    /// Admin surface port (`PUT /mcp/restart`).
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            admin_port: 3000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier.db"),
        }
    }
}

/// Optional artifact upload. Disabled means artifacts are referenced by
/// their engine URL.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    /// Base URL objects are PUT under.
    pub endpoint: Option<String>,
    /// Base URL the uploaded objects are readable from.
    pub public_base: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub system: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: runtime::DEFAULT_MAX_ITERATIONS,
            system: None,
        }
    }
}

/// Model used by `atelier chat`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    /// Anthropic API key. Usually supplied as `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: None,
            max_tokens: 4096,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, else start from defaults. Environment
    /// overrides are applied either way.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("COMFYUI_HOST") {
            self.engine.host = Some(host);
        }
        if let Some(secure) = lookup("COMFYUI_SECURE") {
            self.engine.secure = parse_flag("COMFYUI_SECURE", &secure)?;
        }
        if let Some(host) = lookup("MCP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MCP_PORT") {
            self.server.port = parse_port("MCP_PORT", &port)?;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.admin_port = parse_port("SERVER_PORT", &port)?;
        }
        if let Some(path) = lookup("ATELIER_DB") {
            self.catalog.path = PathBuf::from(path);
        }
        if let Some(enabled) = lookup("UPLOAD_ENABLED") {
            self.upload.enabled = parse_flag("UPLOAD_ENABLED", &enabled)?;
        }
        if let Some(endpoint) = lookup("UPLOAD_ENDPOINT") {
            self.upload.endpoint = Some(endpoint);
        }
        if let Some(base) = lookup("UPLOAD_PUBLIC_BASE") {
            self.upload.public_base = Some(base);
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(model) = lookup("ATELIER_MODEL") {
            self.model.model = model;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<EngineEndpoint, ConfigError> {
        let host = self.engine.host.as_deref().unwrap_or_default();
        EngineEndpoint::new(host, self.engine.secure).map_err(|_| ConfigError::MissingEngineHost)
    }

    pub fn engine(&self) -> Result<HttpEngine, ConfigError> {
        Ok(HttpEngine::new(self.endpoint()?)
            .submit_timeout(Duration::from_secs(self.engine.submit_timeout_secs))
            .health_timeout(Duration::from_secs(self.engine.health_timeout_secs)))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs)
    }

    pub fn tool_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.server_ip()?, self.server.port))
    }

    pub fn admin_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.server_ip()?, self.server.admin_port))
    }

    fn server_ip(&self) -> Result<IpAddr, ConfigError> {
        self.server
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("server host '{}'", self.server.host)))
    }

    pub fn sink(&self) -> Result<Arc<dyn ArtifactSink>, ConfigError> {
        if !self.upload.enabled {
            return Ok(Arc::new(PassThroughSink));
        }
        match (&self.upload.endpoint, &self.upload.public_base) {
            (Some(endpoint), Some(base)) => Ok(Arc::new(HttpUploadSink::new(endpoint, base))),
            _ => Err(ConfigError::Invalid(
                "upload is enabled but upload.endpoint or upload.public_base is missing".into(),
            )),
        }
    }

    pub fn api_key(&self) -> Result<&str, ConfigError> {
        self.model
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{key}='{value}' is not a boolean"))),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}='{value}' is not a port")))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("engine host not configured: set engine.host or COMFYUI_HOST")]
    MissingEngineHost,

    #[error("API key not configured: set model.api_key or ANTHROPIC_API_KEY")]
    MissingApiKey,

    #[error("invalid config: {0}")]
    Invalid(String),
}
