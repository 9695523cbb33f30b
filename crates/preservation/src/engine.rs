use std::sync::{Arc, Mutex};
use std::time::Instant;

use resource::Resource;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};
use crate::policy::{default_policies, PolicyManager, PolicyOutcome, PreservationEvents};
use crate::registry::{StrategyRegistry, DEFAULT_ANNOTATION_BASE};
use crate::strategy::PreservationStrategy;

/// Settings for [`PolicyEngine::from_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Strategy used when no rule matches. Must be registered.
    pub default_strategy: String,
    pub annotation_base: String,
    /// Byte size above which annotation payloads are compressed and
    /// `CustomConfig` fields are moved to annotations.
    pub field_size_threshold: usize,
    pub use_default_policies: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_strategy: "deep-copy".into(),
            annotation_base: DEFAULT_ANNOTATION_BASE.into(),
            field_size_threshold: 1024,
            use_default_policies: true,
        }
    }
}

impl EngineConfig {
    pub fn with_default_strategy(mut self, name: impl Into<String>) -> Self {
        self.default_strategy = name.into();
        self
    }

    pub fn with_annotation_base(mut self, base: impl Into<String>) -> Self {
        self.annotation_base = base.into();
        self
    }

    pub fn with_field_size_threshold(mut self, bytes: usize) -> Self {
        self.field_size_threshold = bytes;
        self
    }

    pub fn with_default_policies(mut self, enabled: bool) -> Self {
        self.use_default_policies = enabled;
        self
    }
}

/// Point-in-time counters. Never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub policies_evaluated: u64,
    pub rules_evaluated: u64,
    pub rules_matched: u64,
    pub preservation_successes: u64,
    pub preservation_failures: u64,
    pub restorations: u64,
    pub restoration_failures: u64,
}

/// Policy matching plus strategy dispatch behind one call.
#[derive(Debug)]
pub struct PolicyEngine {
    registry: Arc<StrategyRegistry>,
    manager: Arc<PolicyManager>,
    default_strategy: String,
    metrics: Mutex<EngineMetrics>,
}

impl PolicyEngine {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        manager: Arc<PolicyManager>,
        default_strategy: impl Into<String>,
    ) -> Result<Self, PreservationError> {
        let default_strategy = default_strategy.into();
        if !registry.contains(&default_strategy) {
            return Err(PreservationError::InvalidConfiguration(format!(
                "default strategy `{default_strategy}` is not registered"
            )));
        }
        Ok(Self {
            registry,
            manager,
            default_strategy,
            metrics: Mutex::new(EngineMetrics::default()),
        })
    }

    /// Standard strategies, optionally the standard policies, and `events`
    /// as the action sink.
    pub fn from_config(
        config: &EngineConfig,
        events: Arc<dyn PreservationEvents>,
    ) -> Result<Self, PreservationError> {
        let registry = Arc::new(StrategyRegistry::with_defaults(
            &config.annotation_base,
            config.field_size_threshold,
        )?);
        let manager = Arc::new(PolicyManager::new(Arc::clone(&registry), events));
        if config.use_default_policies {
            manager.register_policies(default_policies(config.field_size_threshold))?;
        }
        Self::new(registry, manager, config.default_strategy.clone())
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<PolicyManager> {
        &self.manager
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    /// Preserve `field` with the winning rule's strategy, or the default
    /// strategy when no rule matches.
    pub fn preserve_field(
        &self,
        object: &mut Resource,
        field: &mut FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        let outcome = self.evaluate(object, field)?;
        let (name, strategy) = match outcome.decision {
            Some(decision) => (decision.strategy_name, decision.strategy),
            None => {
                debug!(field = %field.path, strategy = %self.default_strategy, "default_strategy_used");
                let strategy = self.registry.get(&self.default_strategy)?;
                (self.default_strategy.clone(), strategy)
            }
        };
        self.apply(object, field, name, &strategy)
    }

    /// Like [`preserve_field`](Self::preserve_field), but `Ok(None)` when
    /// no rule matches instead of using the default strategy.
    pub fn preserve_field_if_matched(
        &self,
        object: &mut Resource,
        field: &mut FieldDescriptor,
    ) -> Result<Option<PreservedField>, PreservationError> {
        let outcome = self.evaluate(object, field)?;
        match outcome.decision {
            Some(decision) => self
                .apply(object, field, decision.strategy_name, &decision.strategy)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Restore with the strategy the record was produced by. Records that
    /// carry no registry name fall back to the first registered strategy of
    /// the recorded type.
    pub fn restore_field(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        let result = self
            .resolve(preserved)
            .and_then(|strategy| strategy.restore(object, preserved));
        {
            let mut metrics = self.lock_metrics();
            match result {
                Ok(()) => metrics.restorations += 1,
                Err(_) => metrics.restoration_failures += 1,
            }
        }
        if let Err(err) = &result {
            warn!(field = %preserved.path(), strategy = %preserved.strategy_used, error = %err, "restore_failure");
        }
        result
    }

    pub fn metrics(&self) -> EngineMetrics {
        *self.lock_metrics()
    }

    fn evaluate(
        &self,
        object: &Resource,
        field: &mut FieldDescriptor,
    ) -> Result<PolicyOutcome, PreservationError> {
        let outcome = self.manager.apply_policies(object, field)?;
        {
            let mut metrics = self.lock_metrics();
            metrics.policies_evaluated += outcome.policies_evaluated;
            metrics.rules_evaluated += outcome.rules_evaluated;
            metrics.rules_matched += outcome.rules_matched;
        }
        Ok(outcome)
    }

    fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
        name: String,
        strategy: &PreservationStrategy,
    ) -> Result<PreservedField, PreservationError> {
        let started = Instant::now();
        let result = strategy.apply(object, field);
        let elapsed_micros = started.elapsed().as_micros() as u64;
        {
            let mut metrics = self.lock_metrics();
            match result {
                Ok(_) => metrics.preservation_successes += 1,
                Err(_) => metrics.preservation_failures += 1,
            }
        }
        match result {
            Ok(mut preserved) => {
                debug!(field = %field.path, strategy = %name, elapsed_micros, "field_preserved");
                preserved.registered_as = Some(name);
                Ok(preserved)
            }
            Err(err) => {
                warn!(field = %field.path, strategy = %name, error = %err, elapsed_micros, "preservation_failure");
                Err(err)
            }
        }
    }

    fn resolve(&self, preserved: &PreservedField) -> Result<Arc<PreservationStrategy>, PreservationError> {
        if let Some(name) = &preserved.registered_as {
            return self.registry.get(name);
        }
        self.registry
            .list()
            .iter()
            .filter_map(|name| self.registry.get(name).ok())
            .find(|strategy| strategy.strategy_type() == preserved.strategy_used)
            .ok_or_else(|| PreservationError::not_found("strategy", preserved.strategy_used.as_str()))
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, EngineMetrics> {
        // Counters stay usable after a panicking holder.
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
