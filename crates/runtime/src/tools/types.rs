//! Tool output types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A resolved artifact handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub uri: String,
    pub mime_type: String,
    pub filename: String,
}

impl ContentRef {
    pub fn new(uri: impl Into<String>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        Self {
            uri: uri.into(),
            mime_type: engine::mime_type(&filename).to_string(),
            filename,
        }
    }
}

/// What a registry tool returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Content(Vec<ContentRef>),
    Text(String),
}

impl ToolOutput {
    /// JSON form handed to the model.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Content(refs) => serde_json::to_value(refs).unwrap_or(Value::Null),
            Self::Text(text) => Value::String(text.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_ref_mime_and_json() {
        let content = ContentRef::new("https://cdn/a.webp", "a.webp");
        assert_eq!(content.mime_type, "image/webp");
        assert_eq!(
            ToolOutput::Content(vec![content]).to_value(),
            json!([{"uri": "https://cdn/a.webp", "mimeType": "image/webp", "filename": "a.webp"}])
        );
        assert_eq!(ToolOutput::Text("ok".into()).to_value(), json!("ok"));
    }
}
