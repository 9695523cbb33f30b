//! Workspace umbrella crate for schemashift: versioned resource migration.
//!
//! The stage crates are re-exported under their own names ([`resource`],
//! [`preservation`], [`optimizer`], [`batch`]). [`Migrator`] wires them
//! together from one [`MigrateConfig`] so callers get a single entry point
//! for both admission-time conversion and bulk migration.
//!
//! ```
//! use std::sync::Arc;
//! use schemashift::{MigrateConfig, Migrator};
//! use schemashift::resource::{InMemoryStore, MapperRegistry, Resource};
//! use serde_json::json;
//!
//! let mut config = MigrateConfig::default();
//! config.optimizer.sweep_interval_secs = 0;
//! let migrator = Migrator::builder(config)
//!     .store(Arc::new(InMemoryStore::new()))
//!     .mappers(Arc::new(MapperRegistry::with_passthrough()))
//!     .build()
//!     .unwrap();
//!
//! let source = Resource::new("example.io/v1alpha1", "Widget", "default", "w")
//!     .with_status(json!({"phase": "Ready"}));
//! let converted = migrator.convert(&source, "v1beta1").unwrap();
//! assert_eq!(converted.api_version(), "example.io/v1beta1");
//! assert_eq!(converted.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
//! ```

pub mod config;

pub use batch;
pub use optimizer;
pub use preservation;
pub use resource;

pub use crate::config::{
    BatchYamlConfig, ConfigLoadError, ConversionYamlConfig, MigrateConfig, OptimizerYamlConfig,
    PolicyYamlConfig,
};
pub use batch::{
    BatchConfig, BatchConversionResult, BatchError, BatchMetrics, BatchObserver, BatchProcessor,
    BatchStatus, ConversionError, ConversionReport, Converter, ConverterConfig,
};
pub use optimizer::{ConversionOptimizer, OptimizeError, OptimizerConfig, PerformanceMetrics};
pub use preservation::{EngineConfig, EngineMetrics, PolicyEngine, PreservationError};
pub use resource::{
    InMemoryStore, ListFilter, MapperRegistry, OpContext, Resource, ResourceRef, ResourceStore,
};

use std::sync::Arc;

use optimizer::strategies::ComponentConverter;
use preservation::{CustomPredicate, FieldDescriptor, PreservationEvents, TracingEvents};
use thiserror::Error;
use tracing::info;

/// Errors raised while assembling a [`Migrator`].
#[derive(Debug, Error)]
pub enum MigratorError {
    #[error(transparent)]
    Config(#[from] ConfigLoadError),
    #[error("preservation setup failed: {0}")]
    Preservation(#[from] PreservationError),
    #[error("optimizer setup failed: {0}")]
    Optimizer(#[from] OptimizeError),
    #[error("batch setup failed: {0}")]
    Batch(#[from] BatchError),
    #[error("migrator needs a {0}")]
    Missing(&'static str),
}

/// Fully wired migration stack.
#[derive(Debug)]
pub struct Migrator {
    config: MigrateConfig,
    engine: Arc<PolicyEngine>,
    optimizer: Arc<ConversionOptimizer>,
    converter: Arc<Converter>,
    processor: BatchProcessor,
}

impl Migrator {
    pub fn builder(config: MigrateConfig) -> MigratorBuilder {
        MigratorBuilder::new(config)
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn optimizer(&self) -> &Arc<ConversionOptimizer> {
        &self.optimizer
    }

    pub fn converter(&self) -> &Arc<Converter> {
        &self.converter
    }

    pub fn processor(&self) -> &BatchProcessor {
        &self.processor
    }

    /// Admission entry point: convert one object synchronously.
    pub fn convert(&self, object: &Resource, target: &str) -> Result<Resource, ConversionError> {
        self.converter.convert(object, target)
    }

    pub fn process_batch(
        &self,
        ctx: &OpContext,
        resources: &[ResourceRef],
        target: &str,
    ) -> Result<Vec<BatchConversionResult>, BatchError> {
        self.processor.process_batch(ctx, resources, target)
    }

    pub fn migrate_all(
        &self,
        ctx: &OpContext,
        filter: &ListFilter,
        target: &str,
    ) -> Result<Vec<BatchConversionResult>, BatchError> {
        self.processor.migrate_all(ctx, filter, target)
    }
}

/// Collects the pieces a [`Migrator`] cannot derive from configuration.
pub struct MigratorBuilder {
    config: MigrateConfig,
    store: Option<Arc<dyn ResourceStore>>,
    mappers: Option<Arc<MapperRegistry>>,
    events: Arc<dyn PreservationEvents>,
    predicates: Vec<(String, CustomPredicate)>,
    component_converter: Option<ComponentConverter>,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl MigratorBuilder {
    fn new(config: MigrateConfig) -> Self {
        Self {
            config,
            store: None,
            mappers: None,
            events: Arc::new(TracingEvents),
            predicates: Vec::new(),
            component_converter: None,
            observer: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mappers(mut self, mappers: Arc<MapperRegistry>) -> Self {
        self.mappers = Some(mappers);
        self
    }

    /// Sink for policy `metric` and `alert` actions. Defaults to tracing.
    pub fn events(mut self, events: Arc<dyn PreservationEvents>) -> Self {
        self.events = events;
        self
    }

    /// Named predicate for `custom` policy conditions. Registered before
    /// the configured policies are compiled.
    pub fn predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Resource, &FieldDescriptor) -> bool + Send + Sync + 'static,
    {
        self.predicates.push((name.into(), Arc::new(predicate)));
        self
    }

    pub fn component_converter(mut self, converter: ComponentConverter) -> Self {
        self.component_converter = Some(converter);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Migrator, MigratorError> {
        let config = self.config;
        config.validate()?;
        let store = self.store.ok_or(MigratorError::Missing("resource store"))?;
        let mappers = self.mappers.ok_or(MigratorError::Missing("mapper registry"))?;

        let engine = PolicyEngine::from_config(&config.policy.engine_config(), self.events)?;
        for (name, predicate) in self.predicates {
            engine
                .manager()
                .register_predicate(name, move |object, field| predicate(object, field))?;
        }
        engine
            .manager()
            .register_policies(config.policy.policies.iter().cloned())?;
        let engine = Arc::new(engine);

        let optimizer_config = config.optimizer.optimizer_config();
        let optimizer = Arc::new(match self.component_converter {
            Some(component) => ConversionOptimizer::with_component_converter(optimizer_config, component)?,
            None => ConversionOptimizer::new(optimizer_config)?,
        });

        let converter = Arc::new(
            Converter::new(Arc::clone(&engine), mappers)
                .with_optimizer(Arc::clone(&optimizer))
                .with_config(config.conversion.converter_config()),
        );

        let mut processor =
            BatchProcessor::new(store, Arc::clone(&converter), config.batch.batch_config())?;
        if let Some(observer) = self.observer {
            processor = processor.with_observer(observer);
        }

        info!(
            name = config.name.as_deref().unwrap_or("unnamed"),
            policies = engine.manager().policies().len(),
            cache = config.optimizer.cache_enabled,
            workers = config.batch.max_workers,
            "migrator_ready"
        );
        Ok(Migrator {
            config,
            engine,
            optimizer,
            converter,
            processor,
        })
    }
}
