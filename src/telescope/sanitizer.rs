//! Conversion of arbitrary values into safe, bounded, redacted JSON
//!
//! Three passes, in order:
//! 1. structural conversion (`RawValue` → `serde_json::Value`): cycles,
//!    binary payloads, callables, dates, regexes and errors get fixed shapes
//! 2. redaction of every key matching the sensitive-key denylist, at any depth
//! 3. size bounding: an oversized result is replaced by
//!    `{"truncated": true, "data": "<serialized prefix>"}`
//!
//! Redaction runs before bounding so that a truncated prefix never carries
//! a secret. [`sanitize`] never fails; any error degrades to a summary.

use super::raw_value::RawValue;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub const REDACTED: &str = "[REDACTED]";
pub const CIRCULAR: &str = "[Circular]";
pub const MAX_DEPTH_MARKER: &str = "[Max Depth]";

/// Nesting depth after which values are replaced by [`MAX_DEPTH_MARKER`]
pub const MAX_DEPTH: usize = 64;

/// Serialized length of `{"data":"","truncated":true}`
pub const TRUNCATION_OVERHEAD: usize = 28;

/// Normalized (lowercase, no `-`/`_`) fragments that mark a key as sensitive
const SENSITIVE_KEYS: &[&str] = &["password", "token", "secret", "authorization", "cookie", "apikey"];

const BINARY_PREVIEW_BYTES: usize = 32;
const SUMMARY_KEY_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
enum SanitizeError {
    #[error("shared value lock poisoned")]
    Poisoned,

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sanitizer options
#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOptions {
    /// Maximum serialized size in bytes; `None` disables bounding
    pub max_size: Option<usize>,
}

impl SanitizeOptions {
    pub fn bounded(max_size: usize) -> Self {
        Self {
            max_size: Some(max_size),
        }
    }
}

/// Sanitize a raw value. Never panics and never fails.
pub fn sanitize(value: &RawValue, options: SanitizeOptions) -> Value {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| try_sanitize(value, options)));

    match result {
        Ok(Ok(sanitized)) => sanitized,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, kind = value.type_name(), "Sanitization degraded to summary");
            degraded_summary(value, &e.to_string())
        }
        Err(_) => {
            tracing::warn!(kind = value.type_name(), "Sanitizer panicked, degraded to summary");
            degraded_summary(value, "sanitizer panicked")
        }
    }
}

/// Redact and bound a value that is already JSON-safe
pub fn sanitize_json(value: Value, max_size: Option<usize>) -> Value {
    let redacted = redact(value);
    match max_size {
        Some(max) => match bound_size(redacted, max) {
            Ok(bounded) => bounded,
            Err(e) => json!({ "error": e.to_string(), "type": "object" }),
        },
        None => redacted,
    }
}

fn try_sanitize(value: &RawValue, options: SanitizeOptions) -> Result<Value, SanitizeError> {
    let mut converter = Converter::default();
    let structural = converter.convert(value, 0)?;
    let redacted = redact(structural);

    match options.max_size {
        Some(max) => bound_size(redacted, max),
        None => Ok(redacted),
    }
}

/// Structural conversion with ancestor tracking for cycle detection
#[derive(Default)]
struct Converter {
    /// Addresses of shared nodes currently being converted
    ancestors: Vec<usize>,
}

impl Converter {
    fn convert(&mut self, value: &RawValue, depth: usize) -> Result<Value, SanitizeError> {
        if depth > MAX_DEPTH {
            return Ok(Value::String(MAX_DEPTH_MARKER.to_string()));
        }

        let converted = match value {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::Number(n) => Value::Number(n.clone()),
            RawValue::String(s) => Value::String(s.clone()),
            RawValue::Binary(bytes) => binary_summary(bytes),
            RawValue::Date(date) => {
                Value::String(date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            }
            RawValue::Regex(re) => Value::String(format!("/{}/", re.as_str())),
            RawValue::Error(err) => json!({
                "name": err.name,
                "message": err.message,
                "stack": err.stack,
            }),
            RawValue::Function(name) => Value::String(match name {
                Some(name) => format!("[Function: {}]", name),
                None => "[Function]".to_string(),
            }),
            RawValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.convert(item, depth + 1)?);
                }
                Value::Array(out)
            }
            RawValue::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, item) in fields {
                    out.insert(key.clone(), self.convert(item, depth + 1)?);
                }
                Value::Object(out)
            }
            RawValue::Shared(node) => {
                let addr = Arc::as_ptr(node) as usize;
                if self.ancestors.contains(&addr) {
                    return Ok(Value::String(CIRCULAR.to_string()));
                }

                let guard = node.read().map_err(|_| SanitizeError::Poisoned)?;
                self.ancestors.push(addr);
                let result = self.convert(&guard, depth);
                self.ancestors.pop();
                result?
            }
        };

        Ok(converted)
    }
}

fn binary_summary(bytes: &[u8]) -> Value {
    let preview = &bytes[..bytes.len().min(BINARY_PREVIEW_BYTES)];
    json!({
        "type": "binary",
        "size": bytes.len(),
        "previewPrefix": base64::engine::general_purpose::STANDARD.encode(preview),
    })
}

/// Whether a key names a secret (case-insensitive substring match, `-`/`_` ignored)
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect();

    SENSITIVE_KEYS.iter().any(|fragment| normalized.contains(fragment))
}

/// Replace the value of every sensitive key, at any depth
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

/// Wrap `value` as a truncated prefix if its serialized form exceeds `max` bytes
fn bound_size(value: Value, max: usize) -> Result<Value, SanitizeError> {
    let serialized = serde_json::to_string(&value)?;
    if serialized.len() <= max {
        return Ok(value);
    }

    Ok(json!({
        "truncated": true,
        "data": escaped_prefix(&serialized, max),
    }))
}

/// Longest prefix of `s` whose JSON-escaped form fits in `max` bytes
fn escaped_prefix(s: &str, max: usize) -> String {
    let mut used = 0;
    let mut end = 0;

    for (idx, c) in s.char_indices() {
        let cost = escaped_len(c);
        if used + cost > max {
            break;
        }
        used += cost;
        end = idx + c.len_utf8();
    }

    s[..end].to_string()
}

/// Bytes `c` occupies inside a serde_json string literal
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Truncate a string to at most `max_chars` characters
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Best-effort description of a value that could not be sanitized
fn degraded_summary(value: &RawValue, error: &str) -> Value {
    match value.keys() {
        Some(keys) => {
            let has_more = keys.len() > SUMMARY_KEY_LIMIT;
            let keys: Vec<String> = keys.into_iter().take(SUMMARY_KEY_LIMIT).collect();
            json!({
                "error": error,
                "type": value.type_name(),
                "keys": keys,
                "hasMoreKeys": has_more,
            })
        }
        None => json!({ "error": error, "type": value.type_name() }),
    }
}
