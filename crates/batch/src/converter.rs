//! Single-resource conversion, shared by the admission path and the batch
//! workers.
//!
//! Order per object: optimization pipeline (cached) → preserve matching
//! fields → field mapping → restore preserved fields in reverse → stamp the
//! target `apiVersion` → finalize lazy and compressed fields.

use std::sync::Arc;

use optimizer::ConversionOptimizer;
use preservation::{FieldDescriptor, PolicyEngine, PreservedField};
use resource::path::upper_camel;
use resource::{MapperRegistry, Resource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ConversionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Top-level sections whose direct children become preservation
    /// candidates, e.g. `Status` yields `Status.Phase`.
    pub descriptor_roots: Vec<String>,
    /// Preserve fields no rule matched with the engine's default strategy.
    pub preserve_unmatched: bool,
    /// Materialize lazy references and inflate compressed fields before
    /// returning the converted object. Without it, lazy references in the
    /// output resolve only while the optimizer still caches the result.
    pub finalize_output: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            descriptor_roots: vec!["Spec".into(), "Status".into()],
            preserve_unmatched: false,
            finalize_output: true,
        }
    }
}

impl ConverterConfig {
    pub fn with_descriptor_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_preserve_unmatched(mut self, enabled: bool) -> Self {
        self.preserve_unmatched = enabled;
        self
    }

    pub fn with_finalize_output(mut self, enabled: bool) -> Self {
        self.finalize_output = enabled;
        self
    }
}

/// What one [`Converter::convert_with_report`] call did.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub resource: Resource,
    /// The source was already at the target version and was returned as is.
    pub skipped: bool,
    pub cache_hit: bool,
    /// Optimization steps that changed the working copy.
    pub optimizations: Vec<&'static str>,
    /// Paths preserved and restored around the field mapping.
    pub preserved: Vec<String>,
}

/// Converts one object to a target version. Safe to share between threads.
#[derive(Debug, Clone)]
pub struct Converter {
    engine: Arc<PolicyEngine>,
    mappers: Arc<MapperRegistry>,
    optimizer: Option<Arc<ConversionOptimizer>>,
    config: ConverterConfig,
}

impl Converter {
    pub fn new(engine: Arc<PolicyEngine>, mappers: Arc<MapperRegistry>) -> Self {
        Self {
            engine,
            mappers,
            optimizer: None,
            config: ConverterConfig::default(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Arc<ConversionOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_config(mut self, config: ConverterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn mappers(&self) -> &Arc<MapperRegistry> {
        &self.mappers
    }

    pub fn optimizer(&self) -> Option<&Arc<ConversionOptimizer>> {
        self.optimizer.as_ref()
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Full `apiVersion` for `target`, which is either a bare version
    /// (`v1beta1`, reusing the object's group) or `group/version`.
    pub fn target_api_version(&self, object: &Resource, target: &str) -> Result<String, ConversionError> {
        let unsupported = || ConversionError::UnsupportedTarget {
            api_version: object.api_version().to_string(),
            target: target.to_string(),
        };
        match target.split_once('/') {
            Some((group, version)) => {
                if version.is_empty() || version.contains('/') || group != object.group() {
                    return Err(unsupported());
                }
                Ok(target.to_string())
            }
            None if target.is_empty() => Err(unsupported()),
            None if object.group().is_empty() => Ok(target.to_string()),
            None => Ok(format!("{}/{}", object.group(), target)),
        }
    }

    pub fn is_at_target(&self, object: &Resource, target: &str) -> bool {
        self.target_api_version(object, target)
            .is_ok_and(|api_version| api_version == object.api_version())
    }

    pub fn convert(&self, source: &Resource, target: &str) -> Result<Resource, ConversionError> {
        self.convert_with_report(source, target)
            .map(|report| report.resource)
    }

    pub fn convert_with_report(
        &self,
        source: &Resource,
        target: &str,
    ) -> Result<ConversionReport, ConversionError> {
        let api_version = self.target_api_version(source, target)?;
        if source.api_version() == api_version {
            debug!(resource = %source.reference(), target, "already_at_target");
            return Ok(ConversionReport {
                resource: source.clone(),
                skipped: true,
                cache_hit: false,
                optimizations: Vec::new(),
                preserved: Vec::new(),
            });
        }
        let from_version = source.version().to_string();
        let to_version = api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&api_version)
            .to_string();

        let (mut object, cache_hit, optimizations, _lease) = match &self.optimizer {
            Some(optimizer) => {
                let optimized = optimizer.optimize_conversion(source, &to_version);
                (
                    optimized.resource,
                    optimized.cache_hit,
                    optimized.applied,
                    Some(optimized.lease),
                )
            }
            None => (source.clone(), false, Vec::new(), None),
        };

        let records = self.preserve(&mut object)?;
        self.mappers.map(&mut object, &from_version, &to_version)?;
        for record in records.iter().rev() {
            self.engine
                .restore_field(&mut object, record)
                .map_err(|source| ConversionError::Restore {
                    path: record.path().to_string(),
                    source,
                })?;
        }
        object.set_api_version(api_version);

        if self.config.finalize_output {
            if let Some(optimizer) = &self.optimizer {
                optimizer.finalize(&mut object)?;
            }
        }

        info!(
            resource = %object.reference(),
            from = %from_version,
            to = %to_version,
            preserved = records.len(),
            cache_hit,
            "resource_converted"
        );
        Ok(ConversionReport {
            resource: object,
            skipped: false,
            cache_hit,
            optimizations,
            preserved: records.iter().map(|r| r.path().to_string()).collect(),
        })
    }

    fn preserve(&self, object: &mut Resource) -> Result<Vec<PreservedField>, ConversionError> {
        let mut records = Vec::new();
        for mut descriptor in self.descriptors(object)? {
            let outcome = if self.config.preserve_unmatched {
                self.engine.preserve_field(object, &mut descriptor).map(Some)
            } else {
                self.engine.preserve_field_if_matched(object, &mut descriptor)
            };
            let record = outcome.map_err(|source| ConversionError::Preservation {
                path: descriptor.path.clone(),
                source,
            })?;
            if let Some(record) = record {
                debug!(field = %descriptor.path, strategy = %record.strategy_used, "field_preserved");
                records.push(record);
            }
        }
        Ok(records)
    }

    /// One descriptor per direct child of each configured root.
    fn descriptors(&self, object: &Resource) -> Result<Vec<FieldDescriptor>, ConversionError> {
        let mut descriptors = Vec::new();
        for root in &self.config.descriptor_roots {
            let Some(Value::Object(section)) = object.get_field(root)? else {
                continue;
            };
            let root = upper_camel(root);
            descriptors.extend(section.iter().map(|(key, value)| {
                FieldDescriptor::new(format!("{root}.{}", upper_camel(key)), value.clone())
            }));
        }
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimizer::{CacheConfig, OptimizerConfig};
    use preservation::{EngineConfig, RecordingEvents};
    use resource::{FnMapper, MapperError};
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> Arc<PolicyEngine> {
        Arc::new(
            PolicyEngine::from_config(&EngineConfig::default(), Arc::new(RecordingEvents::new()))
                .unwrap(),
        )
    }

    fn source() -> Resource {
        Resource::new("observability.io/v1alpha1", "ObservabilityPlatform", "monitoring", "prod")
            .with_spec(json!({"retention": "7d", "replicas": 2}))
            .with_status(json!({"phase": "Ready", "conditions": [{"type": "Available"}]}))
    }

    /// v1alpha1 `retention` becomes v1beta1 `retentionPeriod`; status is
    /// dropped by the mapping and must come back through preservation.
    fn renaming_mappers() -> Arc<MapperRegistry> {
        let mappers = MapperRegistry::new();
        mappers
            .register(
                "v1alpha1",
                "v1beta1",
                Arc::new(FnMapper::new(
                    |object: &mut Resource| -> Result<(), MapperError> {
                        if let Some(retention) = object.remove_field("spec.retention")? {
                            object.set_field("spec.retentionPeriod", retention)?;
                        }
                        object.remove_field("status")?;
                        Ok(())
                    },
                    |object: &mut Resource| -> Result<(), MapperError> {
                        if let Some(period) = object.remove_field("spec.retentionPeriod")? {
                            object.set_field("spec.retention", period)?;
                        }
                        Ok(())
                    },
                )),
            )
            .unwrap();
        Arc::new(mappers)
    }

    #[test]
    fn target_accepts_bare_and_qualified_versions() {
        let converter = Converter::new(engine(), Arc::new(MapperRegistry::with_passthrough()));
        let object = source();
        assert_eq!(
            converter.target_api_version(&object, "v1beta1").unwrap(),
            "observability.io/v1beta1"
        );
        assert_eq!(
            converter.target_api_version(&object, "observability.io/v1").unwrap(),
            "observability.io/v1"
        );
        assert!(matches!(
            converter.target_api_version(&object, "other.io/v1").unwrap_err(),
            ConversionError::UnsupportedTarget { .. }
        ));
        assert!(converter.target_api_version(&object, "").is_err());
        assert!(converter.is_at_target(&object, "v1alpha1"));
    }

    #[test]
    fn status_survives_a_mapping_that_drops_it() {
        let converter = Converter::new(engine(), renaming_mappers());
        let report = converter.convert_with_report(&source(), "v1beta1").unwrap();
        let converted = report.resource;

        assert_eq!(converted.api_version(), "observability.io/v1beta1");
        assert_eq!(converted.get_field("spec.retentionPeriod").unwrap(), Some(&json!("7d")));
        assert_eq!(converted.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
        assert!(report.preserved.contains(&"Status.Phase".to_string()));
        assert!(!report.skipped);
    }

    #[test]
    fn converting_at_target_is_a_no_op() {
        let converter = Converter::new(engine(), renaming_mappers());
        let converted = converter.convert(&source(), "v1beta1").unwrap();
        let again = converter.convert_with_report(&converted, "v1beta1").unwrap();
        assert!(again.skipped);
        assert_eq!(again.resource, converted);
    }

    #[test]
    fn missing_mapper_is_a_conversion_error() {
        let converter = Converter::new(engine(), Arc::new(MapperRegistry::new()));
        let err = converter.convert(&source(), "v1").unwrap_err();
        assert!(matches!(err, ConversionError::Mapping(MapperError::NoMapper { .. })));
    }

    #[test]
    fn optimizer_output_is_finalized() {
        let optimizer = ConversionOptimizer::new(
            OptimizerConfig::default()
                .with_cache(CacheConfig::default().with_sweep_interval(Duration::ZERO))
                .with_lazy_threshold(64),
        )
        .unwrap();
        let converter = Converter::new(engine(), Arc::new(MapperRegistry::with_passthrough()))
            .with_optimizer(Arc::new(optimizer));
        let raw = "x".repeat(200);
        let object = source().with_spec(json!({"rawConfig": raw}));

        let first = converter.convert_with_report(&object, "v1beta1").unwrap();
        assert!(first.optimizations.contains(&"lazy-loading"));
        assert_eq!(first.resource.get_field("spec.rawConfig").unwrap(), Some(&json!(raw)));

        let second = converter.convert_with_report(&object, "v1beta1").unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.resource, first.resource);
        assert_eq!(converter.optimizer().unwrap().lazy_values_held(), 0);
    }

    #[test]
    fn cached_lazy_payload_belongs_to_its_own_resource_version() {
        let optimizer = ConversionOptimizer::new(
            OptimizerConfig::default()
                .with_cache(CacheConfig::default().with_sweep_interval(Duration::ZERO))
                .with_lazy_threshold(16),
        )
        .unwrap();
        let converter = Converter::new(engine(), Arc::new(MapperRegistry::with_passthrough()))
            .with_optimizer(Arc::new(optimizer));
        let mut v5 = source().with_spec(json!({"rawConfig": "A".repeat(64)}));
        v5.set_resource_version("5");
        let mut v6 = source().with_spec(json!({"rawConfig": "B".repeat(64)}));
        v6.set_resource_version("6");

        let first = converter.convert(&v5, "v1beta1").unwrap();
        converter.convert(&v6, "v1beta1").unwrap();
        let cached = converter.convert_with_report(&v5, "v1beta1").unwrap();

        assert!(cached.cache_hit);
        assert_eq!(cached.resource.get_field("spec.rawConfig").unwrap(), Some(&json!("A".repeat(64))));
        assert_eq!(cached.resource, first);
    }

    #[test]
    fn unmatched_fields_use_the_default_strategy_when_asked() {
        let engine = engine();
        let converter = Converter::new(Arc::clone(&engine), Arc::new(MapperRegistry::with_passthrough()))
            .with_config(ConverterConfig::default().with_preserve_unmatched(true));
        let object = Resource::new("example.io/v1", "Widget", "default", "w")
            .with_spec(json!({"replicas": 3}));

        let report = converter.convert_with_report(&object, "v2").unwrap();
        assert_eq!(report.preserved, vec!["Spec.Replicas".to_string()]);
        assert_eq!(engine.metrics().restorations, 1);
    }
}
