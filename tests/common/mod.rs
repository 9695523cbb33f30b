#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schemashift::batch::BackoffConfig;
use schemashift::preservation::RecordingEvents;
use schemashift::resource::StoreError;
use schemashift::{
    BatchConfig, Converter, EngineConfig, InMemoryStore, ListFilter, MapperRegistry, OpContext,
    PolicyEngine, Resource, ResourceRef, ResourceStore,
};
use serde_json::json;

pub const KIND: &str = "ObservabilityPlatform";
pub const NAMESPACE: &str = "monitoring";

pub fn platform(name: &str) -> Resource {
    Resource::new("observability.io/v1alpha1", KIND, NAMESPACE, name)
        .with_spec(json!({"retention": "7d", "replicas": 2}))
        .with_status(json!({"phase": "Ready"}))
}

pub fn reference(name: &str) -> ResourceRef {
    ResourceRef::new(KIND, NAMESPACE, name)
}

pub fn seeded_store(count: usize) -> InMemoryStore {
    let store = InMemoryStore::new();
    for i in 0..count {
        store.insert(platform(&format!("p{i}"))).expect("seed");
    }
    store
}

pub fn converter() -> Arc<Converter> {
    let engine = PolicyEngine::from_config(&EngineConfig::default(), Arc::new(RecordingEvents::new()))
        .expect("engine");
    Arc::new(Converter::new(
        Arc::new(engine),
        Arc::new(MapperRegistry::with_passthrough()),
    ))
}

pub fn fast_batch(workers: usize) -> BatchConfig {
    BatchConfig::default()
        .with_max_workers(workers)
        .with_backoff(BackoffConfig::default().with_base_delay(Duration::from_millis(1)))
        .with_timeout(Duration::from_secs(30))
}

/// Delegates to an in-memory store, failing the first `conflicts` updates
/// of each resource in `flaky` with an optimistic-concurrency conflict.
pub struct ConflictingStore {
    pub inner: InMemoryStore,
    conflicts: u32,
    flaky: Vec<String>,
    seen: Mutex<HashMap<String, u32>>,
    pub update_calls: AtomicU64,
}

impl ConflictingStore {
    pub fn new(inner: InMemoryStore, conflicts: u32, flaky: &[&str]) -> Self {
        Self {
            inner,
            conflicts,
            flaky: flaky.iter().map(|name| name.to_string()).collect(),
            seen: Mutex::new(HashMap::new()),
            update_calls: AtomicU64::new(0),
        }
    }

    pub fn updates(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl ResourceStore for ConflictingStore {
    fn get(&self, ctx: &OpContext, reference: &ResourceRef) -> Result<Resource, StoreError> {
        self.inner.get(ctx, reference)
    }

    fn update(&self, ctx: &OpContext, resource: &Resource) -> Result<Resource, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.flaky.iter().any(|name| name == resource.name()) {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(resource.name().to_string()).or_insert(0);
            if *count < self.conflicts {
                *count += 1;
                return Err(StoreError::Conflict {
                    reference: resource.reference(),
                    expected: resource.resource_version().to_string(),
                    actual: "concurrent-writer".into(),
                });
            }
        }
        self.inner.update(ctx, resource)
    }

    fn list(&self, ctx: &OpContext, filter: &ListFilter) -> Result<Vec<Resource>, StoreError> {
        self.inner.list(ctx, filter)
    }
}
