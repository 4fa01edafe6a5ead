//! Substitution paths into workflow templates.
//!
//! A path is a dotted list of object keys with optional `[n]` array indexes,
//! e.g. `3.inputs.seed` or `12.inputs.loras[1].strength`.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed substitution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePath {
    raw: String,
    segments: Vec<Segment>,
}

impl FromStr for TemplatePath {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for piece in raw.split('.') {
            let (key, mut rest) = match piece.find('[') {
                Some(at) => piece.split_at(at),
                None => (piece, ""),
            };
            if key.is_empty() && rest.is_empty() {
                return Err("has an empty segment".into());
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("has an unclosed index in '{piece}'"))?;
                let index = rest[1..close]
                    .parse()
                    .map_err(|_| format!("has a bad index in '{piece}'"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(format!("has trailing text in '{piece}'"));
                }
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl fmt::Display for TemplatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TemplatePath {
    /// Check that the path names a writable location in `doc`.
    ///
    /// Every segment but the last must exist. The last may be a missing key
    /// of an existing object, or an in-bounds array index.
    pub fn check(&self, doc: &Value) -> Result<(), String> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err("is empty".into());
        };
        let mut node = doc;
        for segment in parents {
            node = match (segment, node) {
                (Segment::Key(key), Value::Object(map)) => map
                    .get(key)
                    .ok_or_else(|| format!("does not exist (no key '{key}')"))?,
                (Segment::Index(i), Value::Array(items)) => items
                    .get(*i)
                    .ok_or_else(|| format!("does not exist (index {i} out of range)"))?,
                (segment, _) => return Err(format!("cannot descend into {segment:?}")),
            };
        }
        match (last, node) {
            (Segment::Key(_), Value::Object(_)) => Ok(()),
            (Segment::Index(i), Value::Array(items)) if *i < items.len() => Ok(()),
            (segment, _) => Err(format!("is not writable at {segment:?}")),
        }
    }

    /// Overwrite the location with `value`.
    pub fn write(&self, doc: &mut Value, value: Value) -> Result<(), String> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err("is empty".into());
        };
        let mut node = doc;
        for segment in parents {
            node = match (segment, node) {
                (Segment::Key(key), Value::Object(map)) => map
                    .get_mut(key)
                    .ok_or_else(|| format!("does not exist (no key '{key}')"))?,
                (Segment::Index(i), Value::Array(items)) => items
                    .get_mut(*i)
                    .ok_or_else(|| format!("does not exist (index {i} out of range)"))?,
                (segment, _) => return Err(format!("cannot descend into {segment:?}")),
            };
        }
        match (last, node) {
            (Segment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (Segment::Index(i), Value::Array(items)) if *i < items.len() => {
                items[*i] = value;
                Ok(())
            }
            (segment, _) => Err(format!("is not writable at {segment:?}")),
        }
    }
}
