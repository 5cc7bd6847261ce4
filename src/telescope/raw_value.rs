//! Untyped runtime values handed to the sanitizer
//!
//! `RawValue` is what the capture pipeline sees before sanitization: request
//! and response payloads, exception context, anything a caller wants
//! recorded. Unlike `serde_json::Value` it can hold binary payloads, dates,
//! regexes, errors and opaque callables, and `Shared` nodes allow aliasing
//! (and therefore cycles).

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Reference-counted node; the only way to build aliased or cyclic structures
pub type SharedValue = Arc<RwLock<RawValue>>;

#[derive(Debug, Clone)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Binary(Bytes),
    Date(DateTime<Utc>),
    Regex(regex::Regex),
    Error(ErrorValue),
    /// Opaque callable, optionally named
    Function(Option<String>),
    Array(Vec<RawValue>),
    /// Ordered key/value pairs
    Object(Vec<(String, RawValue)>),
    Shared(SharedValue),
}

/// Error object payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RawValue {
    /// Wrap a value in a shared node
    pub fn shared(value: RawValue) -> SharedValue {
        Arc::new(RwLock::new(value))
    }

    /// Empty object
    pub fn object() -> Self {
        RawValue::Object(Vec::new())
    }

    /// Insert or replace a field; no-op unless `self` is an object
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RawValue>) {
        if let RawValue::Object(fields) = self {
            let key = key.into();
            let value = value.into();
            match fields.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => *slot = value,
                None => fields.push((key, value)),
            }
        }
    }

    /// Build from any `std::error::Error`
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let name = std::any::type_name_of_val(err)
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        RawValue::Error(ErrorValue {
            name,
            message: err.to_string(),
            stack: None,
        })
    }

    /// Short kind name, used in degraded summaries
    pub fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "boolean",
            RawValue::Number(_) => "number",
            RawValue::String(_) => "string",
            RawValue::Binary(_) => "binary",
            RawValue::Date(_) => "date",
            RawValue::Regex(_) => "regexp",
            RawValue::Error(_) => "error",
            RawValue::Function(_) => "function",
            RawValue::Array(_) => "array",
            RawValue::Object(_) => "object",
            RawValue::Shared(node) => match node.try_read() {
                Ok(inner) => inner.type_name(),
                Err(_) => "object",
            },
        }
    }

    /// Object keys in insertion order, `None` for non-objects
    pub fn keys(&self) -> Option<Vec<String>> {
        match self {
            RawValue::Object(fields) => Some(fields.iter().map(|(k, _)| k.clone()).collect()),
            RawValue::Shared(node) => node.try_read().ok().and_then(|inner| inner.keys()),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => RawValue::Number(n),
            serde_json::Value::String(s) => RawValue::String(s),
            serde_json::Value::Array(items) => {
                RawValue::Array(items.into_iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                RawValue::Object(map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect())
            }
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::String(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value.into())
    }
}

impl From<f64> for RawValue {
    /// Non-finite floats have no JSON form and become `Null`
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(RawValue::Number)
            .unwrap_or(RawValue::Null)
    }
}

impl From<Bytes> for RawValue {
    fn from(value: Bytes) -> Self {
        RawValue::Binary(value)
    }
}

impl From<Vec<u8>> for RawValue {
    fn from(value: Vec<u8>) -> Self {
        RawValue::Binary(Bytes::from(value))
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(value: DateTime<Utc>) -> Self {
        RawValue::Date(value)
    }
}

impl From<SharedValue> for RawValue {
    fn from(value: SharedValue) -> Self {
        RawValue::Shared(value)
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RawValue::Null)
    }
}
