//! Cache key construction
//!
//! Keys are `prefix ++ join(parts, ":")`. String parts are used verbatim,
//! numbers and booleans in their display form, and structured parts (objects,
//! arrays) as canonical JSON. `serde_json` keeps object keys sorted, so two
//! filter objects with the same fields in a different insertion order produce
//! the same key. Part order is the caller's responsibility.

use serde::Serialize;
use serde_json::Value;

use crate::error::CacheError;

const SEPARATOR: &str = ":";

/// Builder for deterministic cache keys
///
/// ```
/// use shared_cache_engine::KeyCodec;
/// use serde_json::json;
///
/// let key = KeyCodec::new("kpi:")
///     .part("dealer")
///     .part(42)
///     .part(json!({"range": "30d", "channel": "web"}))
///     .build();
/// assert_eq!(key, r#"kpi:dealer:42:{"channel":"web","range":"30d"}"#);
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    prefix: String,
    parts: Vec<String>,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            parts: Vec::new(),
        }
    }

    /// Append a part
    ///
    /// Parts that fail to serialize are encoded as `null`; use
    /// [`try_part`](Self::try_part) to surface that instead.
    #[must_use]
    pub fn part<T: Serialize>(mut self, part: T) -> Self {
        let value = serde_json::to_value(part).unwrap_or(Value::Null);
        self.parts.push(canonical_part(&value));
        self
    }

    /// Append a part, failing if it cannot be serialized
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] if `part` has no JSON form.
    pub fn try_part<T: Serialize>(mut self, part: T) -> Result<Self, CacheError> {
        let value = serde_json::to_value(part).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.parts.push(canonical_part(&value));
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> String {
        let mut key = self.prefix;
        key.push_str(&self.parts.join(SEPARATOR));
        key
    }

    /// One-shot form of the builder for already-collected parts
    #[must_use]
    pub fn build_key(prefix: &str, parts: &[Value]) -> String {
        let joined = parts.iter().map(canonical_part).collect::<Vec<_>>().join(SEPARATOR);
        format!("{prefix}{joined}")
    }
}

fn canonical_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        structured => structured.to_string(),
    }
}
