use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::context::OpContext;
use crate::error::StoreError;
use crate::object::{Resource, ResourceRef};

/// Storage surface the migration core needs from the cluster.
/// Implementations must be safe to call from many worker threads at once.
pub trait ResourceStore: Send + Sync {
    /// Fetch the current state of a resource.
    fn get(&self, ctx: &OpContext, reference: &ResourceRef) -> Result<Resource, StoreError>;
    /// Write a resource back, failing with [`StoreError::Conflict`] when its
    /// `resourceVersion` is stale. Returns the stored object.
    fn update(&self, ctx: &OpContext, resource: &Resource) -> Result<Resource, StoreError>;
    /// List resources matching a filter.
    fn list(&self, ctx: &OpContext, filter: &ListFilter) -> Result<Vec<Resource>, StoreError>;
}

/// Selection criteria for [`ResourceStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.kind.as_deref().is_none_or(|k| k == resource.kind())
            && self
                .namespace
                .as_deref()
                .is_none_or(|ns| ns == resource.namespace())
            && self
                .labels
                .iter()
                .all(|(k, v)| resource.label(k) == Some(v.as_str()))
    }
}

/// An in-memory store using a `RwLock` around a `BTreeMap`.
///
/// Every write bumps a store-wide counter that becomes the object's
/// `resourceVersion`, giving the same optimistic-concurrency contract as a
/// real API server.
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<ResourceRef, Resource>>,
    revision: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    /// Create or replace a resource unconditionally, returning the stored copy.
    pub fn insert(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        resource.set_resource_version(self.next_revision());
        self.objects
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .insert(resource.reference(), resource.clone());
        Ok(resource)
    }

    pub fn delete(&self, reference: &ResourceRef) -> Result<Option<Resource>, StoreError> {
        Ok(self
            .objects
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .remove(reference))
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore for InMemoryStore {
    fn get(&self, ctx: &OpContext, reference: &ResourceRef) -> Result<Resource, StoreError> {
        ctx.check()?;
        let guard = self
            .objects
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        guard
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }

    fn update(&self, ctx: &OpContext, resource: &Resource) -> Result<Resource, StoreError> {
        ctx.check()?;
        let reference = resource.reference();
        // Write lock is held across the version check and the swap.
        let mut guard = self
            .objects
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let current = guard
            .get(&reference)
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        if current.resource_version() != resource.resource_version() {
            return Err(StoreError::Conflict {
                reference,
                expected: resource.resource_version().to_string(),
                actual: current.resource_version().to_string(),
            });
        }

        let mut stored = resource.clone();
        stored.set_resource_version(self.next_revision());
        guard.insert(reference, stored.clone());
        Ok(stored)
    }

    fn list(&self, ctx: &OpContext, filter: &ListFilter) -> Result<Vec<Resource>, StoreError> {
        ctx.check()?;
        let guard = self
            .objects
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(guard
            .values()
            .filter(|resource| filter.matches(resource))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use serde_json::json;

    fn widget(name: &str) -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "default", name)
            .with_spec(json!({"replicas": 1}))
    }

    #[test]
    fn insert_assigns_resource_versions() {
        let store = InMemoryStore::new();
        let a = store.insert(widget("a")).unwrap();
        let b = store.insert(widget("b")).unwrap();
        assert_eq!(a.resource_version(), "1");
        assert_eq!(b.resource_version(), "2");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_detects_stale_versions() {
        let store = InMemoryStore::new();
        let ctx = OpContext::background();
        let stored = store.insert(widget("a")).unwrap();

        let updated = store.update(&ctx, &stored).unwrap();
        assert_ne!(updated.resource_version(), stored.resource_version());

        let err = store.update(&ctx, &stored).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn get_and_update_missing_resource() {
        let store = InMemoryStore::new();
        let ctx = OpContext::background();
        let missing = widget("ghost");
        assert!(store.get(&ctx, &missing.reference()).unwrap_err().is_not_found());
        assert!(store.update(&ctx, &missing).unwrap_err().is_not_found());
    }

    #[test]
    fn list_applies_filter() {
        let store = InMemoryStore::new();
        store.insert(widget("a").with_label("tier", "web")).unwrap();
        store.insert(widget("b")).unwrap();
        store
            .insert(Resource::new("v1", "ConfigMap", "default", "cm"))
            .unwrap();
        let ctx = OpContext::background();

        let widgets = store
            .list(&ctx, &ListFilter::new().with_kind("Widget"))
            .unwrap();
        assert_eq!(widgets.len(), 2);

        let web = store
            .list(&ctx, &ListFilter::new().with_label("tier", "web"))
            .unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].name(), "a");
    }

    #[test]
    fn calls_fail_once_context_is_cancelled() {
        let store = InMemoryStore::new();
        let stored = store.insert(widget("a")).unwrap();
        let ctx = OpContext::background();
        ctx.cancel();
        assert_eq!(
            store.get(&ctx, &stored.reference()).unwrap_err(),
            StoreError::Context(ContextError::Cancelled)
        );
    }
}
