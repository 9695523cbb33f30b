use std::sync::Arc;
use std::thread;

use resource::Resource;
use serde_json::{Map, Value};
use tracing::debug;

use super::{marker, OptimizationStrategy};
use crate::error::OptimizeError;

/// Converts one entry of `spec.components`: `(name, value, target_version)`.
pub type ComponentConverter =
    Arc<dyn Fn(&str, &Value, &str) -> Result<Value, String> + Send + Sync>;

/// Component converter that returns every component unchanged.
pub fn identity_component() -> ComponentConverter {
    Arc::new(|_: &str, value: &Value, _: &str| -> Result<Value, String> {
        Ok(value.clone())
    })
}

/// Converts the independent entries of `spec.components` on a bounded
/// pool of scoped threads.
#[derive(Clone)]
pub struct ParallelizationStrategy {
    max_workers: usize,
    converter: ComponentConverter,
}

impl ParallelizationStrategy {
    pub fn new(max_workers: usize, converter: ComponentConverter) -> Self {
        Self {
            max_workers: max_workers.max(1),
            converter,
        }
    }
}

impl std::fmt::Debug for ParallelizationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelizationStrategy")
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl OptimizationStrategy for ParallelizationStrategy {
    fn name(&self) -> &'static str {
        "parallelization"
    }

    fn can_optimize(&self, object: &Resource, _target_version: &str) -> bool {
        components(object).is_some_and(|components| components.len() > 1)
    }

    fn optimize(&self, object: &mut Resource, target_version: &str) -> Result<(), OptimizeError> {
        let Some(items) = components(object) else {
            return Ok(());
        };
        let items: Vec<(&String, &Value)> = items.iter().collect();
        let workers = self.max_workers.min(items.len()).max(1);
        let chunk_size = items.len().div_ceil(workers);

        let converted = thread::scope(|scope| {
            let handles: Vec<_> = items
                .chunks(chunk_size)
                .map(|chunk| {
                    let converter = &self.converter;
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|(name, value)| {
                                converter(name.as_str(), *value, target_version)
                                    .map(|converted| ((*name).clone(), converted))
                                    .map_err(|reason| OptimizeError::Component {
                                        name: (*name).clone(),
                                        reason,
                                    })
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();

            let mut converted = Map::new();
            for handle in handles {
                let chunk = handle.join().map_err(|_| OptimizeError::Component {
                    name: "*".into(),
                    reason: "component worker panicked".into(),
                })??;
                converted.extend(chunk);
            }
            Ok::<_, OptimizeError>(converted)
        })?;

        let count = converted.len();
        object.set_field("spec.components", Value::Object(converted))?;
        object.set_annotation(marker("parallel-converted"), count.to_string());
        debug!(resource = %object.reference(), components = count, workers, "components_converted");
        Ok(())
    }
}

fn components(object: &Resource) -> Option<&Map<String, Value>> {
    object.spec()?.get("components")?.as_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object() -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "default", "w").with_spec(json!({
            "components": {
                "api": {"replicas": 1},
                "worker": {"replicas": 2},
                "cron": {"replicas": 3}
            }
        }))
    }

    #[test]
    fn converts_every_component() {
        let converter: ComponentConverter = Arc::new(|name: &str, value: &Value, target: &str| -> Result<Value, String> {
            let mut out = value.clone();
            out["convertedFor"] = json!(format!("{name}@{target}"));
            Ok(out)
        });
        let strategy = ParallelizationStrategy::new(2, converter);
        let mut target = object();
        assert!(strategy.can_optimize(&target, "v1beta1"));
        strategy.optimize(&mut target, "v1beta1").unwrap();

        assert_eq!(
            target.get_field("spec.components.worker").unwrap(),
            Some(&json!({"replicas": 2, "convertedFor": "worker@v1beta1"}))
        );
        assert_eq!(target.annotation("conversion.schemashift.io/parallel-converted"), Some("3"));
    }

    #[test]
    fn one_failing_component_fails_the_step() {
        let converter: ComponentConverter = Arc::new(|name: &str, value: &Value, _: &str| -> Result<Value, String> {
            if name == "cron" {
                Err("unsupported schedule".into())
            } else {
                Ok(value.clone())
            }
        });
        let mut target = object();
        let err = ParallelizationStrategy::new(4, converter)
            .optimize(&mut target, "v1beta1")
            .unwrap_err();
        assert!(matches!(err, OptimizeError::Component { ref name, .. } if name == "cron"));
    }

    #[test]
    fn single_component_is_not_worth_it() {
        let object = Resource::new("example.io/v1alpha1", "Widget", "default", "w")
            .with_spec(json!({"components": {"api": {}}}));
        assert!(!ParallelizationStrategy::new(4, identity_component()).can_optimize(&object, "v1"));
    }
}
