//! Engine event decoding.
//!
//! The engine pushes JSON messages of the form `{"type": ..., "data": ...}`
//! over the event channel. [`EngineEvent::decode`] turns them into a closed
//! enum; unknown tags decode to `None` and are ignored by callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag of an engine event, used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    ExecutionStart,
    ExecutionCached,
    Progress,
    Executing,
    Executed,
    ExecutionError,
    Error,
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "status" => Self::Status,
            "execution_start" => Self::ExecutionStart,
            "execution_cached" => Self::ExecutionCached,
            "progress" => Self::Progress,
            "executing" => Self::Executing,
            "executed" => Self::Executed,
            "execution_error" => Self::ExecutionError,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionCached => "execution_cached",
            Self::Progress => "progress",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::ExecutionError => "execution_error",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampler progress of the running node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    pub value: u64,
    pub max: u64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// One output file produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_artifact_kind")]
    pub kind: String,
}

fn default_artifact_kind() -> String {
    "output".to_string()
}

/// Outputs of a node as reported by an `executed` event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<Artifact>,
}

/// Payload of an `executed` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedData {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub display_node: Option<String>,
    #[serde(default)]
    pub output: NodeOutput,
    #[serde(default)]
    pub prompt_id: String,
}

/// A decoded engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status(Value),
    ExecutionStart(Value),
    ExecutionCached(Value),
    Progress(ProgressData),
    Executing(Value),
    /// `None` when the event carried no usable data.
    Executed(Option<ExecutedData>),
    ExecutionError(String),
    Error(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    tag: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

const UNKNOWN_ERROR: &str = "Unknown engine error";

impl EngineEvent {
    /// Decode one inbound text frame. Returns `None` for frames to ignore.
    pub fn decode(text: &str) -> Option<Self> {
        let raw: RawEvent = serde_json::from_str(text).ok()?;
        let kind = EventKind::from_tag(raw.tag.as_deref()?)?;

        let event = match kind {
            EventKind::Status => Self::Status(raw.data),
            EventKind::ExecutionStart => Self::ExecutionStart(raw.data),
            EventKind::ExecutionCached => Self::ExecutionCached(raw.data),
            EventKind::Executing => Self::Executing(raw.data),
            EventKind::Progress => match serde_json::from_value(raw.data) {
                Ok(progress) => Self::Progress(progress),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed progress event");
                    return None;
                }
            },
            EventKind::Executed => {
                let data = match raw.data {
                    Value::Null => None,
                    data => serde_json::from_value(data).ok(),
                };
                Self::Executed(data)
            }
            EventKind::ExecutionError => {
                Self::ExecutionError(error_message(&raw.data, raw.message.as_deref()))
            }
            EventKind::Error => Self::Error(error_message(&raw.data, raw.message.as_deref())),
        };
        Some(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status(_) => EventKind::Status,
            Self::ExecutionStart(_) => EventKind::ExecutionStart,
            Self::ExecutionCached(_) => EventKind::ExecutionCached,
            Self::Progress(_) => EventKind::Progress,
            Self::Executing(_) => EventKind::Executing,
            Self::Executed(_) => EventKind::Executed,
            Self::ExecutionError(_) => EventKind::ExecutionError,
            Self::Error(_) => EventKind::Error,
        }
    }
}

fn error_message(data: &Value, message: Option<&str>) -> String {
    data.pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| data.get("exception_message").and_then(Value::as_str))
        .or(message)
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_ERROR)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_progress() {
        let event =
            EngineEvent::decode(r#"{"type":"progress","data":{"value":3,"max":20,"node":"3"}}"#)
                .unwrap();
        match event {
            EngineEvent::Progress(p) => {
                assert_eq!((p.value, p.max), (3, 20));
                assert_eq!(p.node.as_deref(), Some("3"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_executed_images() {
        let text = r#"{"type":"executed","data":{"node":"9","display_node":"9",
            "output":{"images":[{"filename":"a.png","subfolder":"","type":"output"},
                                {"filename":"b.png"}]},"prompt_id":"p1"}}"#;
        let Some(EngineEvent::Executed(Some(data))) = EngineEvent::decode(text) else {
            panic!("expected executed data");
        };
        assert_eq!(data.node, "9");
        assert_eq!(data.prompt_id, "p1");
        assert_eq!(data.output.images.len(), 2);
        assert_eq!(data.output.images[1].kind, "output");
    }

    #[test]
    fn executed_without_data() {
        assert_eq!(
            EngineEvent::decode(r#"{"type":"executed"}"#),
            Some(EngineEvent::Executed(None))
        );
    }

    #[test]
    fn error_message_fallbacks() {
        let nested = r#"{"type":"execution_error","data":{"error":{"message":"oom"}}}"#;
        let exception = r#"{"type":"execution_error","data":{"exception_message":"bad node"}}"#;
        let top = r#"{"type":"error","message":"boom"}"#;
        let none = r#"{"type":"error"}"#;
        assert_eq!(
            EngineEvent::decode(nested),
            Some(EngineEvent::ExecutionError("oom".into()))
        );
        assert_eq!(
            EngineEvent::decode(exception),
            Some(EngineEvent::ExecutionError("bad node".into()))
        );
        assert_eq!(EngineEvent::decode(top), Some(EngineEvent::Error("boom".into())));
        assert_eq!(
            EngineEvent::decode(none),
            Some(EngineEvent::Error(UNKNOWN_ERROR.into()))
        );
    }

    #[test]
    fn ignores_unknown_and_untyped() {
        assert_eq!(EngineEvent::decode(r#"{"type":"crystools.monitor"}"#), None);
        assert_eq!(EngineEvent::decode(r#"{"data":{}}"#), None);
        assert_eq!(EngineEvent::decode("not json"), None);
    }
}
