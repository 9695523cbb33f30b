use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::strategy::StrategyType;

/// One field of a source object being migrated.
///
/// Created fresh per conversion; only `annotations` changes afterwards
/// (policy actions write there).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Dotted path, e.g. `Status.Phase`.
    pub path: String,
    pub value: Value,
    #[serde(default)]
    pub declared_type: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl FieldDescriptor {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            declared_type: None,
            tags: BTreeMap::new(),
            metadata: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_declared_type(mut self, declared: impl Into<String>) -> Self {
        self.declared_type = Some(declared.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Same descriptor carrying a different value (pipeline stages).
    pub(crate) fn with_value(&self, value: Value) -> Self {
        let mut next = self.clone();
        next.value = value;
        next
    }

    /// Declared type if present, otherwise the JSON type of the value.
    pub fn type_name(&self) -> &str {
        self.declared_type
            .as_deref()
            .unwrap_or_else(|| json_type_name(&self.value))
    }

    /// Byte size: raw length for strings, serialized length otherwise.
    pub fn size_bytes(&self) -> usize {
        value_size(&self.value)
    }
}

/// Record produced by a strategy's `apply`, consumed by its `restore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedField {
    pub descriptor: FieldDescriptor,
    pub original_value: Value,
    pub preserved_at: DateTime<Utc>,
    pub strategy_used: StrategyType,
    /// Registry name the engine resolved this record through.
    #[serde(default)]
    pub registered_as: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// SHA-256 hex of the canonical JSON encoding of `original_value`.
    pub checksum: String,
    /// Sub-records of composite and versioned strategies, keyed by member.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, PreservedField>,
}

impl PreservedField {
    pub fn new(descriptor: &FieldDescriptor, original_value: Value, strategy: StrategyType) -> Self {
        let checksum = checksum(&original_value);
        Self {
            descriptor: descriptor.clone(),
            original_value,
            preserved_at: Utc::now(),
            strategy_used: strategy,
            registered_as: None,
            metadata: BTreeMap::new(),
            checksum,
            components: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// True when `value` hashes to the checksum recorded at apply time.
    pub fn verify(&self, value: &Value) -> bool {
        checksum(value) == self.checksum
    }

    /// Value a pipeline hands to its next stage: the transformed form when
    /// the strategy produced one, the original otherwise.
    pub(crate) fn output_value(&self) -> &Value {
        self.metadata
            .get(TRANSFORMED_KEY)
            .unwrap_or(&self.original_value)
    }
}

pub(crate) const TRANSFORMED_KEY: &str = "transformed";

pub fn checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    // serde_json maps are key-sorted, so equal values encode identically.
    match serde_json::to_vec(value) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => hasher.update(value.to_string().as_bytes()),
    }
    hex::encode(hasher.finalize())
}

pub fn value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map(|v| v.len()).unwrap_or(0),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&json!({"a": 2})));
    }

    #[test]
    fn preserved_field_verifies_original() {
        let field = FieldDescriptor::new("Status.Phase", json!("Ready"));
        let preserved = PreservedField::new(&field, json!("Ready"), StrategyType::DeepCopy);
        assert!(preserved.verify(&json!("Ready")));
        assert!(!preserved.verify(&json!("Failed")));
        assert_eq!(preserved.output_value(), &json!("Ready"));
    }

    #[test]
    fn descriptor_type_and_size() {
        let field = FieldDescriptor::new("Spec.Name", json!("abcd"));
        assert_eq!(field.type_name(), "string");
        assert_eq!(field.size_bytes(), 4);

        let field = FieldDescriptor::new("Spec.Ports", json!([1, 2])).with_declared_type("[]int32");
        assert_eq!(field.type_name(), "[]int32");
        assert_eq!(field.size_bytes(), 5);
    }
}
