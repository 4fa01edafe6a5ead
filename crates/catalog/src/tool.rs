//! Tool definition records.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// The declared type of a workflow parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    #[serde(alias = "number")]
    Float,
}

impl DataType {
    /// JSON Schema type name.
    pub fn schema_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "number",
        }
    }
}

/// Bit width for randomized parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RandomBitWidth {
    B4,
    B8,
    B16,
    B32,
    B64,
}

impl RandomBitWidth {
    pub fn bits(self) -> u32 {
        match self {
            Self::B4 => 4,
            Self::B8 => 8,
            Self::B16 => 16,
            Self::B32 => 32,
            Self::B64 => 64,
        }
    }

    /// Largest value representable at this width.
    pub fn max_value(self) -> u64 {
        match self {
            Self::B64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }
}

impl TryFrom<u8> for RandomBitWidth {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            4 => Ok(Self::B4),
            8 => Ok(Self::B8),
            16 => Ok(Self::B16),
            32 => Ok(Self::B32),
            64 => Ok(Self::B64),
            other => Err(format!("unsupported random bit width: {other}")),
        }
    }
}

impl From<RandomBitWidth> for u8 {
    fn from(width: RandomBitWidth) -> Self {
        width.bits() as u8
    }
}

/// A single parameter of a tool, bound to a location in the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    /// Caller-facing name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub data_type: DataType,
    /// Dotted path inside the workflow template, e.g. `3.inputs.seed`.
    #[serde(alias = "prop")]
    pub substitution_path: String,
    #[serde(default, alias = "isRequired")]
    pub required: bool,
    /// Integer bounds, applied to integer parameters only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Float bounds, applied to float parameters only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_float: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_float: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, alias = "isRandom")]
    pub randomizable: bool,
    #[serde(default, alias = "randomBit", skip_serializing_if = "Option::is_none")]
    pub random_bit_width: Option<RandomBitWidth>,
    /// Whether the parameter is exposed to the model.
    #[serde(default = "default_true", alias = "isToolParameter")]
    pub tool_parameter: bool,
}

impl ParameterSpec {
    /// A required-less, bound-less parameter of the given type.
    pub fn new(name: impl Into<String>, data_type: DataType, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            data_type,
            substitution_path: path.into(),
            required: false,
            min: None,
            max: None,
            min_float: None,
            max_float: None,
            default_value: None,
            randomizable: false,
            random_bit_width: None,
            tool_parameter: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_int_bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_float_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_float = min;
        self.max_float = max;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn randomized(mut self, width: RandomBitWidth) -> Self {
        self.randomizable = true;
        self.random_bit_width = Some(width);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.tool_parameter = false;
        self
    }

    /// Whether the model gets to supply this parameter.
    pub fn is_exposed(&self) -> bool {
        self.tool_parameter && !self.randomizable
    }
}

fn default_true() -> bool {
    true
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A stored tool: a workflow template plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The workflow graph. Accepts either a JSON object or a string holding one.
    #[serde(alias = "workflowDefinition", deserialize_with = "workflow_document")]
    pub workflow_template: Value,
    /// Node whose `executed` event carries the job's artifacts.
    #[serde(default, alias = "endNode", skip_serializing_if = "Option::is_none")]
    pub end_marker: Option<String>,
    #[serde(default = "default_true", alias = "isEnabled")]
    pub enabled: bool,
    #[serde(default, alias = "workflowParameters")]
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, workflow_template: Value) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            workflow_template,
            end_marker: None,
            enabled: true,
            parameters: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_end_marker(mut self, node: impl Into<String>) -> Self {
        self.end_marker = Some(node.into());
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Parse one definition, or an array of them, from JSON text.
    pub fn parse_many(json: &str) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_str(json)?;
        let definitions = match value {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<std::result::Result<Vec<Self>, _>>()?,
            other => vec![serde_json::from_value(other)?],
        };
        for definition in &definitions {
            definition.check()?;
        }
        Ok(definitions)
    }

    /// Structural checks that do not need the binder.
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Invalid("tool name is empty".into()));
        }
        if !self.workflow_template.is_object() {
            return Err(Error::Invalid(format!(
                "workflow template of '{}' is not a JSON object",
                self.name
            )));
        }
        Ok(())
    }
}

fn workflow_document<'de, D>(deserializer: D) -> std::result::Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => serde_json::from_str(&text).map_err(de::Error::custom),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stored_record_shape() {
        let json = r#"{
            "name": "portrait",
            "workflowDefinition": "{\"3\":{\"inputs\":{\"seed\":0}}}",
            "endNode": "9",
            "isEnabled": true,
            "workflowParameters": [
                {"name": "seed", "dataType": "integer", "prop": "3.inputs.seed",
                 "isRandom": true, "randomBit": 32, "isToolParameter": false},
                {"name": "cfg", "dataType": "number", "prop": "3.inputs.cfg",
                 "minFloat": 1.0, "maxFloat": 30.0}
            ]
        }"#;
        let defs = ToolDefinition::parse_many(json).unwrap();
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert_eq!(def.workflow_template, json!({"3": {"inputs": {"seed": 0}}}));
        assert_eq!(def.end_marker.as_deref(), Some("9"));
        assert_eq!(def.parameters[0].random_bit_width, Some(RandomBitWidth::B32));
        assert!(!def.parameters[0].is_exposed());
        assert_eq!(def.parameters[1].data_type, DataType::Float);
        assert_eq!(def.parameters[1].max_float, Some(30.0));
        assert!(def.parameters[1].tool_parameter);
    }

    #[test]
    fn rejects_unsupported_bit_width() {
        let json = r#"{"name": "x", "workflowTemplate": {},
            "parameters": [{"name": "s", "dataType": "integer", "substitutionPath": "a",
            "randomizable": true, "randomBitWidth": 12}]}"#;
        assert!(ToolDefinition::parse_many(json).is_err());
    }

    #[test]
    fn rejects_non_object_template() {
        let json = r#"{"name": "x", "workflowTemplate": [1, 2]}"#;
        assert!(matches!(
            ToolDefinition::parse_many(json),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn bit_width_max_values() {
        assert_eq!(RandomBitWidth::B4.max_value(), 15);
        assert_eq!(RandomBitWidth::B32.max_value(), u32::MAX as u64);
        assert_eq!(RandomBitWidth::B64.max_value(), u64::MAX);
    }
}
