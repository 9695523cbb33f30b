use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FieldPathError;
use crate::path::FieldPath;

/// Identity of a resource inside the store: kind + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// An unstructured, schema-versioned object.
///
/// The wrapped value is always a JSON object; construction through
/// [`Resource::from_value`] or deserialization rejects anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
    object: Value,
}

impl Resource {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mut metadata = Map::new();
        let namespace = namespace.into();
        if !namespace.is_empty() {
            metadata.insert("namespace".into(), Value::String(namespace));
        }
        metadata.insert("name".into(), Value::String(name.into()));

        let mut object = Map::new();
        object.insert("apiVersion".into(), Value::String(api_version.into()));
        object.insert("kind".into(), Value::String(kind.into()));
        object.insert("metadata".into(), Value::Object(metadata));
        Self {
            object: Value::Object(object),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, FieldPathError> {
        if value.is_object() {
            Ok(Self { object: value })
        } else {
            Err(FieldPathError::NotAResource)
        }
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.set_top("spec", spec);
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.set_top("status", status);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_map_mut("labels")
            .insert(key.into(), Value::String(value.into()));
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_annotation(key, value);
        self
    }

    pub fn with_creation_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.metadata_mut()
            .insert("creationTimestamp".into(), Value::String(at.to_rfc3339()));
        self
    }

    pub fn as_value(&self) -> &Value {
        &self.object
    }

    pub fn into_value(self) -> Value {
        self.object
    }

    pub fn api_version(&self) -> &str {
        self.top_str("apiVersion")
    }

    pub fn set_api_version(&mut self, api_version: impl Into<String>) {
        self.set_top("apiVersion", Value::String(api_version.into()));
    }

    /// API group, empty for the core group (`v1`).
    pub fn group(&self) -> &str {
        self.api_version()
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    /// Schema version, e.g. `v1alpha1` from `example.io/v1alpha1`.
    pub fn version(&self) -> &str {
        let api_version = self.api_version();
        api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(api_version)
    }

    pub fn kind(&self) -> &str {
        self.top_str("kind")
    }

    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    pub fn resource_version(&self) -> &str {
        self.metadata_str("resourceVersion")
    }

    pub fn set_resource_version(&mut self, version: impl Into<String>) {
        self.metadata_mut()
            .insert("resourceVersion".into(), Value::String(version.into()));
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.metadata_str("creationTimestamp"))
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind(), self.namespace(), self.name())
    }

    pub fn spec(&self) -> Option<&Value> {
        self.object.get("spec")
    }

    pub fn spec_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.object.get_mut("spec").and_then(Value::as_object_mut)
    }

    pub fn status(&self) -> Option<&Value> {
        self.object.get("status")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata_map("annotations")
            .and_then(|annotations| annotations.get(key))
            .and_then(Value::as_str)
    }

    pub fn annotations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.metadata_map("annotations")
            .into_iter()
            .flat_map(|annotations| annotations.iter())
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata_map_mut("annotations")
            .insert(key.into(), Value::String(value.into()));
    }

    /// Removes an annotation, dropping the annotations map once it is empty.
    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let metadata = self.object.get_mut("metadata")?.as_object_mut()?;
        let annotations = metadata.get_mut("annotations")?.as_object_mut()?;
        let removed = annotations.remove(key)?;
        if annotations.is_empty() {
            metadata.remove("annotations");
        }
        match removed {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata_map("labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }

    /// Reads a value by dotted field path (`Status.Phase`).
    pub fn get_field(&self, path: &str) -> Result<Option<&Value>, FieldPathError> {
        Ok(FieldPath::parse(path)?.get(&self.object))
    }

    /// Writes a value by dotted field path, creating intermediate objects.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), FieldPathError> {
        FieldPath::parse(path)?.set(&mut self.object, value)
    }

    pub fn remove_field(&mut self, path: &str) -> Result<Option<Value>, FieldPathError> {
        Ok(FieldPath::parse(path)?.remove(&mut self.object))
    }

    /// Serialized size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.object).map(|v| v.len()).unwrap_or(0)
    }

    fn top_str(&self, key: &str) -> &str {
        self.object.get(key).and_then(Value::as_str).unwrap_or("")
    }

    fn set_top(&mut self, key: &str, value: Value) {
        if let Some(map) = self.object.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    fn metadata_str(&self, key: &str) -> &str {
        self.object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    fn metadata_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let root = ensure_object(&mut self.object);
        ensure_object(
            root.entry("metadata")
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }

    fn metadata_map_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        ensure_object(
            self.metadata_mut()
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new())),
        )
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value normalized to an object"),
    }
}

impl TryFrom<Value> for Resource {
    type Error = FieldPathError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_value(value)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        resource.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget() -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "default", "w1")
            .with_spec(json!({"replicas": 2, "largeConfig": "abc"}))
            .with_status(json!({"phase": "Ready"}))
    }

    #[test]
    fn accessors_read_identity() {
        let r = widget();
        assert_eq!(r.api_version(), "example.io/v1alpha1");
        assert_eq!(r.group(), "example.io");
        assert_eq!(r.version(), "v1alpha1");
        assert_eq!(r.kind(), "Widget");
        assert_eq!(r.namespace(), "default");
        assert_eq!(r.name(), "w1");
        assert_eq!(r.reference(), ResourceRef::new("Widget", "default", "w1"));
    }

    #[test]
    fn core_group_version_has_no_group() {
        let r = Resource::new("v1", "ConfigMap", "", "cm");
        assert_eq!(r.group(), "");
        assert_eq!(r.version(), "v1");
        assert_eq!(r.reference().to_string(), "ConfigMap cm");
    }

    #[test]
    fn annotations_round_trip_and_cleanup() {
        let mut r = widget();
        r.set_annotation("a/b", "1");
        assert_eq!(r.annotation("a/b"), Some("1"));
        assert_eq!(r.annotations().count(), 1);
        assert_eq!(r.remove_annotation("a/b"), Some("1".to_string()));
        assert!(r.as_value()["metadata"].get("annotations").is_none());
    }

    #[test]
    fn field_access_by_path() {
        let mut r = widget();
        assert_eq!(r.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
        r.set_field("Spec.LargeConfig", json!("xyz")).unwrap();
        assert_eq!(r.as_value()["spec"]["largeConfig"], json!("xyz"));
        assert_eq!(r.remove_field("Spec.Replicas").unwrap(), Some(json!(2)));
        assert!(r.get_field("Spec.Replicas").unwrap().is_none());
    }

    #[test]
    fn rejects_non_object_values() {
        assert_eq!(
            Resource::from_value(json!([1, 2])),
            Err(FieldPathError::NotAResource)
        );
        assert!(serde_json::from_value::<Resource>(json!("nope")).is_err());
    }

    #[test]
    fn creation_timestamp_parses_rfc3339() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let r = widget().with_creation_timestamp(at);
        assert_eq!(r.creation_timestamp(), Some(at));
    }
}
