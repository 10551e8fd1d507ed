//! Point-in-time field values of one entity.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A single field value inside a [`RawSnapshot`].
///
/// This is a closed, non-self-describing-friendly mirror of a JSON value so the
/// snapshot can be stored with `postcard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(Vec<(String, FieldValue)>),
}

impl FieldValue {
    /// Render the value as a cache-key segment.
    ///
    /// Only scalar values can identify a row; composite values return `None`.
    pub fn as_key_segment(&self) -> Option<String> {
        match self {
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::UInt(u) => Some(u.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    FieldValue::UInt(u)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => FieldValue::Text(s),
            Value::Array(items) => FieldValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                FieldValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Int(i) => Value::from(i),
            FieldValue::UInt(u) => Value::from(u),
            // NaN and infinities have no JSON form
            FieldValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            FieldValue::Text(s) => Value::String(s),
            FieldValue::List(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            FieldValue::Map(fields) => {
                Value::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Immutable, ordered field-name to value mapping captured from an entity.
///
/// Field order follows the entity's declaration order (serde field order).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSnapshot {
    fields: Vec<(String, FieldValue)>,
}

impl RawSnapshot {
    /// Capture the current field values of `entity`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the entity does not serialize to a
    /// field mapping (for example a tuple struct or a bare scalar).
    pub fn capture<T: Serialize>(entity: &T) -> Result<Self> {
        match serde_json::to_value(entity)? {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(Error::Serialization(format!(
                "entity must serialize to a field mapping, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Rebuild an entity from the captured fields.
    pub fn materialize<T: DeserializeOwned>(&self) -> Result<T> {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        serde_json::from_value(Value::Object(map)).map_err(Error::from)
    }

    fn from_map(map: Map<String, Value>) -> Self {
        RawSnapshot {
            fields: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    /// Builder-style field insertion; replaces an existing field in place.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
