//! Parameter coercion, clamping and schema generation.

use catalog::{DataType, ParameterSpec, RandomBitWidth};
use serde_json::{Map, Value, json};

/// Coerce `raw` to the parameter's declared type, then clamp numeric values
/// to the bounds of that same type.
pub fn coerce(spec: &ParameterSpec, raw: &Value) -> Result<Value, String> {
    match spec.data_type {
        DataType::String => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("expected a string".into()),
        },
        DataType::Integer => {
            let value = as_integer(raw).ok_or("expected an integer")?;
            Ok(json!(clamp(value, spec.min, spec.max)))
        }
        DataType::Float => {
            let value = as_float(raw).ok_or("expected a number")?;
            Ok(json!(clamp(value, spec.min_float, spec.max_float)))
        }
    }
}

fn as_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn as_float(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn clamp<T: PartialOrd>(value: T, min: Option<T>, max: Option<T>) -> T {
    let value = match min {
        Some(min) if value < min => min,
        _ => value,
    };
    match max {
        Some(max) if value > max => max,
        _ => value,
    }
}

/// Whether the bounds of the parameter's own type are ordered.
pub fn bounds_ordered(spec: &ParameterSpec) -> bool {
    match spec.data_type {
        DataType::Integer => !matches!((spec.min, spec.max), (Some(lo), Some(hi)) if lo > hi),
        DataType::Float => {
            !matches!((spec.min_float, spec.max_float), (Some(lo), Some(hi)) if lo > hi)
        }
        DataType::String => true,
    }
}

/// A fresh random value in `[0, 2^width - 1]`.
pub fn random_value(width: RandomBitWidth) -> Result<u64, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes) & width.max_value())
}

/// JSON Schema for the parameters the model may supply.
pub fn input_schema(parameters: &[ParameterSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for spec in parameters.iter().filter(|p| p.is_exposed()) {
        let mut property = Map::new();
        property.insert("type".into(), json!(spec.data_type.schema_type()));
        if let Some(description) = &spec.description {
            property.insert("description".into(), json!(description));
        }
        let (min, max) = match spec.data_type {
            DataType::Integer => (spec.min.map(Value::from), spec.max.map(Value::from)),
            DataType::Float => (
                spec.min_float.map(Value::from),
                spec.max_float.map(Value::from),
            ),
            DataType::String => (None, None),
        };
        if let Some(min) = min {
            property.insert("minimum".into(), min);
        }
        if let Some(max) = max {
            property.insert("maximum".into(), max);
        }
        if let Some(default) = spec
            .default_value
            .as_ref()
            .and_then(|d| coerce(spec, &Value::String(d.clone())).ok())
        {
            property.insert("default".into(), default);
        }
        if spec.required && spec.default_value.is_none() {
            required.push(json!(spec.name));
        }
        properties.insert(spec.name.clone(), Value::Object(property));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
