use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use resource::Resource;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{marker, OptimizationStrategy};
use crate::error::OptimizeError;

/// Side store holding the values lazy references point at, with the number
/// of live holders per reference.
pub type LazyStore = DashMap<String, LazyEntry>;

#[derive(Debug, Clone)]
pub struct LazyEntry {
    pub value: Value,
    pub holders: usize,
}

const LAZY_FIELDS: [&str; 3] = ["rawConfig", "customConfig", "advancedSettings"];
const LAZY_TYPE: &str = "lazy-loaded";

/// Replaces large configuration blobs in `spec` with content-addressed
/// references, keeping the values in a concurrent side store until
/// [`materialize`] puts them back.
///
/// A side-store entry lives only while a [`LazyLease`] holds it; the cache
/// keeps its own copy of the values an entry references.
///
/// [`materialize`]: LazyLoadingStrategy::materialize
#[derive(Debug, Clone)]
pub struct LazyLoadingStrategy {
    threshold_bytes: usize,
    store: Arc<LazyStore>,
}

impl LazyLoadingStrategy {
    pub fn new(threshold_bytes: usize) -> Self {
        Self {
            threshold_bytes,
            store: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<LazyStore> {
        &self.store
    }

    /// Swap every lazy reference in `object` for its stored value and drop
    /// the marker annotation. Returns how many references were resolved.
    pub fn materialize(&self, object: &mut Resource) -> Result<usize, OptimizeError> {
        let Some(spec) = object.spec_mut() else {
            return Ok(0);
        };
        let mut resolved = 0;
        for field in LAZY_FIELDS {
            let Some(reference) = spec.get(field).and_then(lazy_reference) else {
                continue;
            };
            let value = self
                .store
                .get(&reference)
                .map(|entry| entry.value.clone())
                .ok_or(OptimizeError::UnresolvedReference(reference))?;
            spec.insert(field.to_string(), value);
            resolved += 1;
        }
        if resolved > 0 {
            object.remove_annotation(&marker("lazy-loaded"));
        }
        Ok(resolved)
    }

    /// References currently placed in `object`.
    pub fn references(&self, object: &Resource) -> Vec<String> {
        let Some(spec) = object.spec() else {
            return Vec::new();
        };
        LAZY_FIELDS
            .into_iter()
            .filter_map(|field| spec.get(field).and_then(lazy_reference))
            .collect()
    }

    /// Values for `references`, for storing next to a cached result.
    pub fn attachments(&self, references: &[String]) -> BTreeMap<String, Value> {
        references
            .iter()
            .filter_map(|reference| {
                self.store
                    .get(reference)
                    .map(|entry| (reference.clone(), entry.value.clone()))
            })
            .collect()
    }

    /// Register every attachment and hold it until the lease drops.
    pub fn lease_attachments(&self, attachments: BTreeMap<String, Value>) -> LazyLease {
        let references = attachments
            .into_iter()
            .map(|(reference, value)| {
                self.acquire(reference.clone(), value);
                reference
            })
            .collect();
        LazyLease::adopt(Arc::clone(&self.store), references)
    }

    /// Take over the holds [`optimize`](OptimizationStrategy::optimize)
    /// registered for the references in `object`.
    pub(crate) fn adopt(&self, object: &Resource) -> LazyLease {
        LazyLease::adopt(Arc::clone(&self.store), self.references(object))
    }

    fn acquire(&self, reference: String, value: Value) {
        self.store
            .entry(reference)
            .and_modify(|entry| entry.holders += 1)
            .or_insert(LazyEntry { value, holders: 1 });
    }

    fn oversized<'a>(&self, spec: &'a Value) -> impl Iterator<Item = (&'static str, &'a Value)> + 'a {
        let threshold = self.threshold_bytes;
        LAZY_FIELDS.into_iter().filter_map(move |field| {
            spec.get(field)
                .filter(|value| lazy_reference(value).is_none() && serialized_len(value) > threshold)
                .map(|value| (field, value))
        })
    }
}

impl OptimizationStrategy for LazyLoadingStrategy {
    fn name(&self) -> &'static str {
        "lazy-loading"
    }

    fn can_optimize(&self, object: &Resource, _target_version: &str) -> bool {
        object
            .spec()
            .is_some_and(|spec| self.oversized(spec).next().is_some())
    }

    /// Each reference created here carries one hold, released by the lease
    /// the optimizer adopts for the output.
    fn optimize(&self, object: &mut Resource, _target_version: &str) -> Result<(), OptimizeError> {
        let Some(spec) = object.spec() else {
            return Ok(());
        };
        let replacements: Vec<(&'static str, Value)> = self
            .oversized(spec)
            .map(|(field, value)| (field, value.clone()))
            .collect();
        if replacements.is_empty() {
            return Ok(());
        }

        let count = replacements.len();
        let spec = object.spec_mut().ok_or_else(|| OptimizeError::codec("spec", "not an object"))?;
        for (field, value) in replacements {
            let size = serialized_len(&value);
            let reference = content_reference(&value);
            self.acquire(reference.clone(), value);
            spec.insert(
                field.to_string(),
                json!({"$ref": reference, "size": size, "type": LAZY_TYPE}),
            );
        }
        object.set_annotation(marker("lazy-loaded"), "true");
        debug!(resource = %object.reference(), fields = count, "lazy_references_created");
        Ok(())
    }
}

/// Holds side-store entries alive. Dropping the last holder of a reference
/// removes its value.
#[derive(Debug)]
pub struct LazyLease {
    store: Arc<LazyStore>,
    references: Vec<String>,
}

impl LazyLease {
    fn adopt(store: Arc<LazyStore>, references: Vec<String>) -> Self {
        Self { store, references }
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }
}

impl Clone for LazyLease {
    fn clone(&self) -> Self {
        for reference in &self.references {
            if let Some(mut entry) = self.store.get_mut(reference) {
                entry.holders += 1;
            }
        }
        Self::adopt(Arc::clone(&self.store), self.references.clone())
    }
}

impl Drop for LazyLease {
    fn drop(&mut self) {
        for reference in &self.references {
            if let Some(mut entry) = self.store.get_mut(reference) {
                entry.holders = entry.holders.saturating_sub(1);
            }
            self.store.remove_if(reference, |_, entry| entry.holders == 0);
        }
    }
}

/// `lazy:` plus the sha-256 of the value's JSON encoding.
fn content_reference(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("lazy:{}", hex::encode(Sha256::digest(&bytes)))
}

fn lazy_reference(value: &Value) -> Option<String> {
    if value.get("type").and_then(Value::as_str) != Some(LAZY_TYPE) {
        return None;
    }
    value.get("$ref").and_then(Value::as_str).map(str::to_string)
}

fn serialized_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map(|v| v.len()).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(raw: Value) -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "prod", "w").with_spec(json!({
            "rawConfig": raw,
            "replicas": 2
        }))
    }

    #[test]
    fn large_fields_become_references_and_come_back() {
        let strategy = LazyLoadingStrategy::new(1024);
        let raw = json!("r".repeat(4096));
        let mut target = object(raw.clone());

        assert!(strategy.can_optimize(&target, "v1beta1"));
        strategy.optimize(&mut target, "v1beta1").unwrap();
        let lease = strategy.adopt(&target);
        let stub = target.get_field("spec.rawConfig").unwrap().unwrap().clone();
        assert_eq!(stub["$ref"], json!(content_reference(&raw)));
        assert_eq!(stub["size"], json!(4096));
        assert_eq!(target.annotation("conversion.schemashift.io/lazy-loaded"), Some("true"));
        assert!(!strategy.can_optimize(&target, "v1beta1"));

        assert_eq!(strategy.materialize(&mut target).unwrap(), 1);
        assert_eq!(target.get_field("spec.rawConfig").unwrap(), Some(&raw));
        assert_eq!(target.annotations().count(), 0);
        drop(lease);
        assert!(strategy.store().is_empty());
    }

    #[test]
    fn references_depend_on_content_not_identity() {
        let strategy = LazyLoadingStrategy::new(16);
        let mut first = object(json!("a".repeat(64)));
        let mut second = object(json!("b".repeat(64)));
        strategy.optimize(&mut first, "v1beta1").unwrap();
        strategy.optimize(&mut second, "v1beta1").unwrap();
        let _leases = (strategy.adopt(&first), strategy.adopt(&second));

        assert_ne!(strategy.references(&first), strategy.references(&second));
        strategy.materialize(&mut first).unwrap();
        assert_eq!(first.get_field("spec.rawConfig").unwrap(), Some(&json!("a".repeat(64))));
    }

    #[test]
    fn shared_values_survive_until_the_last_holder_drops() {
        let strategy = LazyLoadingStrategy::new(16);
        let mut first = object(json!("s".repeat(64)));
        let mut second = first.clone();
        strategy.optimize(&mut first, "v1beta1").unwrap();
        strategy.optimize(&mut second, "v1beta1").unwrap();
        let lease_a = strategy.adopt(&first);
        let lease_b = strategy.adopt(&second);
        assert_eq!(strategy.store().len(), 1);

        drop(lease_a);
        assert_eq!(strategy.materialize(&mut second).unwrap(), 1);
        drop(lease_b);
        assert!(strategy.store().is_empty());
        assert!(matches!(
            strategy.materialize(&mut first).unwrap_err(),
            OptimizeError::UnresolvedReference(_)
        ));
    }

    #[test]
    fn attachments_restore_dropped_values() {
        let strategy = LazyLoadingStrategy::new(16);
        let mut target = object(json!("x".repeat(64)));
        strategy.optimize(&mut target, "v1beta1").unwrap();
        let lease = strategy.adopt(&target);
        let attachments = strategy.attachments(lease.references());
        drop(lease);
        assert!(strategy.store().is_empty());

        let _again = strategy.lease_attachments(attachments);
        assert_eq!(strategy.materialize(&mut target).unwrap(), 1);
    }

    #[test]
    fn small_fields_are_left_alone() {
        let strategy = LazyLoadingStrategy::new(1024);
        assert!(!strategy.can_optimize(&object(json!("small")), "v1beta1"));
    }

    #[test]
    fn unknown_reference_fails_materialize() {
        let strategy = LazyLoadingStrategy::new(1024);
        let mut target = object(json!({"$ref": "lazy:0000", "size": 1, "type": "lazy-loaded"}));
        assert!(matches!(
            strategy.materialize(&mut target).unwrap_err(),
            OptimizeError::UnresolvedReference(_)
        ));
    }
}
