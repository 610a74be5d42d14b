// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Marshalled values and the tagged output union.

use ahash::AHasher;
use serde_json::Map;
use std::hash::{Hash, Hasher};

/// All values crossing the engine boundary are JSON values.
pub type Value = serde_json::Value;

/// Wire-format type markers understood by the relay layer.
pub mod markers {
    pub const TYPE_KEY: &str = "__type__";
    pub const UPDATE: &str = "update";
    pub const SKIP: &str = "skip";
    pub const FINISHED: &str = "finished";
    pub const DIFF: &str = "diff";
    pub const STREAM: &str = "stream";
}

/// One output slot produced by a bound callable.
///
/// `Patch` is an update descriptor: a field delta merged into the target
/// node's exported configuration instead of a plain value. `Skip` leaves the
/// node's current value and state untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Value(Value),
    Patch(Map<String, Value>),
    Skip,
}

impl OutputValue {
    pub fn is_skip(&self) -> bool {
        matches!(self, OutputValue::Skip)
    }

    /// True for `Skip` and for null values. Overflowing output slots that
    /// are all empty are tolerated without a warning.
    pub fn is_empty(&self) -> bool {
        match self {
            OutputValue::Skip => true,
            OutputValue::Value(Value::Null) => true,
            _ => false,
        }
    }

    /// Wire form delivered to the relay layer.
    pub fn to_wire(&self) -> Value {
        match self {
            OutputValue::Value(v) => v.clone(),
            OutputValue::Patch(fields) => {
                let mut map = Map::new();
                map.insert(markers::TYPE_KEY.into(), markers::UPDATE.into());
                for (k, v) in fields {
                    map.insert(k.clone(), v.clone());
                }
                Value::Object(map)
            }
            OutputValue::Skip => type_marker(markers::SKIP),
        }
    }
}

impl From<Value> for OutputValue {
    fn from(value: Value) -> Self {
        OutputValue::Value(value)
    }
}

/// Build a `{"__type__": <kind>}` marker object.
pub fn type_marker(kind: &str) -> Value {
    let mut map = Map::new();
    map.insert(markers::TYPE_KEY.into(), kind.into());
    Value::Object(map)
}

/// The synthetic per-output sentinel emitted when a generator is exhausted.
pub fn finished_sentinel() -> Value {
    type_marker(markers::FINISHED)
}

/// Compute a deterministic fingerprint of a value for change detection.
///
/// Serialized form is hashed so `1.0` and `1` keep their JSON identities.
pub fn fingerprint(value: &Value) -> u64 {
    let mut hasher = AHasher::default();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skip_is_empty() {
        assert!(OutputValue::Skip.is_empty());
        assert!(OutputValue::Value(Value::Null).is_empty());
        assert!(!OutputValue::Value(json!(0)).is_empty());
    }

    #[test]
    fn test_patch_wire_form() {
        let mut fields = Map::new();
        fields.insert("visible".into(), json!(false));
        let wire = OutputValue::Patch(fields).to_wire();
        assert_eq!(wire[markers::TYPE_KEY], markers::UPDATE);
        assert_eq!(wire["visible"], json!(false));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = json!({"x": [1, 2, 3]});
        let b = json!({"x": [1, 2, 3]});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({"x": [1, 2]})));
    }
}
