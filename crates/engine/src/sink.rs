//! Artifact sinks: turn an engine artifact into a stable reference.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SinkError;
use crate::event::Artifact;

/// Destination for produced artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store `artifact`, which can be downloaded from `fetch_url`, and return
    /// the URI callers should see.
    async fn store(&self, artifact: &Artifact, fetch_url: &str) -> Result<String, SinkError>;
}

/// Hands out the engine's own view URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughSink;

#[async_trait]
impl ArtifactSink for PassThroughSink {
    async fn store(&self, _artifact: &Artifact, fetch_url: &str) -> Result<String, SinkError> {
        Ok(fetch_url.to_string())
    }
}

/// Copies artifacts to an object store with plain HTTP `PUT`.
#[derive(Debug, Clone)]
pub struct HttpUploadSink {
    client: reqwest::Client,
    endpoint: String,
    public_base: String,
    timeout: Duration,
}

impl HttpUploadSink {
    pub fn new(endpoint: impl Into<String>, public_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ArtifactSink for HttpUploadSink {
    async fn store(&self, artifact: &Artifact, fetch_url: &str) -> Result<String, SinkError> {
        let response = self
            .client
            .get(fetch_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SinkError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Download(format!(
                "{} returned {}",
                artifact.filename,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SinkError::Download(e.to_string()))?;

        let key = object_key(&artifact.filename);
        let response = self
            .client
            .put(format!("{}/{key}", self.endpoint))
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, mime_type(&artifact.filename))
            .body(bytes)
            .send()
            .await
            .map_err(|e| SinkError::Upload(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Upload(format!("status {}", response.status())));
        }

        debug!(filename = %artifact.filename, key, "artifact uploaded");
        Ok(format!("{}/{key}", self.public_base))
    }
}

/// Fresh object key keeping the original extension.
fn object_key(filename: &str) -> String {
    let id = uuid::Uuid::new_v4();
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{id}.{}", ext.to_ascii_lowercase()),
        None => id.to_string(),
    }
}

/// MIME type guessed from the filename extension.
pub fn mime_type(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Path as UrlPath, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, put};
    use tokio::net::TcpListener;

    const IMAGE: &[u8] = b"\x89PNG fake image bytes";

    /// Objects received by the fake store: key, content type, body.
    type Objects = Arc<Mutex<Vec<(String, String, Vec<u8>)>>>;

    async fn put_object(
        State(objects): State<Objects>,
        UrlPath(key): UrlPath<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        objects
            .lock()
            .unwrap()
            .push((key, content_type, body.to_vec()));
        StatusCode::OK
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn artifact(filename: &str) -> Artifact {
        Artifact {
            filename: filename.into(),
            subfolder: String::new(),
            kind: "output".into(),
        }
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_type("ComfyUI_0001_.png"), "image/png");
        assert_eq!(mime_type("shot.JPEG"), "image/jpeg");
        assert_eq!(mime_type("clip.webm"), "video/webm");
        assert_eq!(mime_type("latent"), "application/octet-stream");
    }

    #[test]
    fn object_key_keeps_extension() {
        let key = object_key("out.PNG");
        assert!(key.ends_with(".png"));
        assert_eq!(key.len(), 36 + 4);
        assert_eq!(object_key("noext").len(), 36);
    }

    #[tokio::test]
    async fn pass_through_returns_fetch_url() {
        let artifact = Artifact {
            filename: "a.png".into(),
            subfolder: String::new(),
            kind: "output".into(),
        };
        let uri = PassThroughSink
            .store(&artifact, "http://engine/view?filename=a.png")
            .await
            .unwrap();
        assert_eq!(uri, "http://engine/view?filename=a.png");
    }

    #[tokio::test]
    async fn upload_copies_bytes_to_store() {
        let objects = Objects::default();
        let router = Router::new()
            .route("/view", get(|| async { IMAGE }))
            .route("/bucket/{key}", put(put_object))
            .with_state(objects.clone());
        let base = serve(router).await;
        let sink = HttpUploadSink::new(format!("{base}/bucket/"), "https://cdn.test/media/");

        let uri = sink
            .store(&artifact("out.PNG"), &format!("{base}/view?filename=out.PNG"))
            .await
            .unwrap();

        let objects = objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        let (key, content_type, body) = &objects[0];
        assert!(key.ends_with(".png"));
        assert_eq!(content_type, "image/png");
        assert_eq!(body.as_slice(), IMAGE);
        assert_eq!(uri, format!("https://cdn.test/media/{key}"));
    }

    #[tokio::test]
    async fn failed_download_is_reported() {
        let objects = Objects::default();
        let router = Router::new()
            .route("/bucket/{key}", put(put_object))
            .with_state(objects.clone());
        let base = serve(router).await;
        let sink = HttpUploadSink::new(format!("{base}/bucket"), "https://cdn.test");

        let err = sink
            .store(&artifact("gone.png"), &format!("{base}/view?filename=gone.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Download(_)));
        assert!(objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_upload_is_reported() {
        let router = Router::new()
            .route("/view", get(|| async { IMAGE }))
            .route(
                "/bucket/{key}",
                put(|| async { StatusCode::FORBIDDEN }),
            );
        let base = serve(router).await;
        let sink = HttpUploadSink::new(format!("{base}/bucket"), "https://cdn.test");

        let err = sink
            .store(&artifact("a.png"), &format!("{base}/view?filename=a.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Upload(detail) if detail.contains("403")));
    }
}
