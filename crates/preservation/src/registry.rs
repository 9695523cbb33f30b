use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::PreservationError;
use crate::strategy::{
    AnnotationStrategy, CompositeMode, CompositeStrategy, ConditionalBranch, ConditionalStrategy,
    ConflictResolution, DeepCopyStrategy, MergeStrategy, PreservationStrategy, TransformStrategy,
    VersionedStrategy,
};

/// Annotation prefix used by the standard `annotation` strategy.
pub const DEFAULT_ANNOTATION_BASE: &str = "migrate.schemashift.io/preserved";

/// Name -> strategy map. Append-mostly and read-heavy.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: RwLock<BTreeMap<String, Arc<PreservationStrategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the standard strategy set:
    /// `deep-copy`, `transform`, `merge`, `annotation`, `conditional`,
    /// `composite` and `versioned`.
    pub fn with_defaults(
        annotation_base: &str,
        size_threshold: usize,
    ) -> Result<Self, PreservationError> {
        let registry = Self::new();
        for (name, strategy) in default_strategies(annotation_base, size_threshold)? {
            registry.register(name, strategy)?;
        }
        Ok(registry)
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        strategy: impl Into<PreservationStrategy>,
    ) -> Result<(), PreservationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PreservationError::InvalidConfiguration(
                "strategy name must not be empty".into(),
            ));
        }
        let strategy = strategy.into();
        strategy.validate()?;

        let mut guard = self
            .strategies
            .write()
            .map_err(|_| PreservationError::InvalidConfiguration("poisoned lock".into()))?;
        if guard.contains_key(&name) {
            return Err(PreservationError::DuplicateStrategy(name));
        }
        debug!(strategy = %name, kind = %strategy.strategy_type(), "strategy_registered");
        guard.insert(name, Arc::new(strategy));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<PreservationStrategy>, PreservationError> {
        self.strategies
            .read()
            .map_err(|_| PreservationError::InvalidConfiguration("poisoned lock".into()))?
            .get(name)
            .cloned()
            .ok_or_else(|| PreservationError::not_found("strategy", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies
            .read()
            .map(|guard| guard.contains_key(name))
            .unwrap_or(false)
    }

    /// All registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.strategies
            .read()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn default_strategies(
    annotation_base: &str,
    size_threshold: usize,
) -> Result<Vec<(&'static str, PreservationStrategy)>, PreservationError> {
    let deep_copy = Arc::new(PreservationStrategy::from(DeepCopyStrategy::new()));
    let annotation = Arc::new(PreservationStrategy::from(
        AnnotationStrategy::new(annotation_base).with_compression_threshold(size_threshold),
    ));

    let conditional = ConditionalStrategy::new()
        .with_branch(ConditionalBranch::new(
            "oversized",
            move |_, field| field.size_bytes() > size_threshold,
            Arc::clone(&annotation),
        ))
        .with_fallback(Arc::clone(&deep_copy));

    let composite = CompositeStrategy::new(CompositeMode::Parallel)
        .with_member("copy", Arc::clone(&deep_copy))
        .with_member("annotation", Arc::clone(&annotation));

    let versioned = VersionedStrategy::new()
        .with_route("^v1alpha", Arc::clone(&annotation))?
        .with_default(Arc::clone(&deep_copy));

    Ok(vec![
        ("deep-copy", DeepCopyStrategy::new().into()),
        ("transform", TransformStrategy::json_string().into()),
        (
            "merge",
            MergeStrategy::deep_merge(ConflictResolution::Merge).into(),
        ),
        ("annotation", (*annotation).clone()),
        ("conditional", conditional.into()),
        ("composite", composite.into()),
        ("versioned", versioned.into()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyType;

    #[test]
    fn register_get_list() {
        let registry = StrategyRegistry::new();
        registry.register("copy", DeepCopyStrategy::new()).unwrap();
        registry
            .register("note", AnnotationStrategy::new("example.io/p"))
            .unwrap();

        assert_eq!(registry.list(), vec!["copy".to_string(), "note".to_string()]);
        assert_eq!(
            registry.get("copy").unwrap().strategy_type(),
            StrategyType::DeepCopy
        );
        assert!(registry.contains("note"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = StrategyRegistry::new();
        registry.register("copy", DeepCopyStrategy::new()).unwrap();
        assert_eq!(
            registry.register("copy", DeepCopyStrategy::new()).unwrap_err(),
            PreservationError::DuplicateStrategy("copy".into())
        );
    }

    #[test]
    fn invalid_strategy_is_rejected_at_registration() {
        let registry = StrategyRegistry::new();
        let err = registry
            .register(
                "merge",
                MergeStrategy::without_merge_fn(ConflictResolution::Merge),
            )
            .unwrap_err();
        assert!(matches!(err, PreservationError::InvalidConfiguration(_)));
        assert!(!registry.contains("merge"));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = StrategyRegistry::new();
        assert!(matches!(
            registry.get("missing").unwrap_err(),
            PreservationError::NotFound { .. }
        ));
    }

    #[test]
    fn defaults_cover_every_variant() {
        let registry = StrategyRegistry::with_defaults(DEFAULT_ANNOTATION_BASE, 1024).unwrap();
        let kinds: Vec<_> = registry
            .list()
            .iter()
            .map(|name| registry.get(name).unwrap().strategy_type())
            .collect();
        for kind in [
            StrategyType::DeepCopy,
            StrategyType::Transform,
            StrategyType::Merge,
            StrategyType::Annotation,
            StrategyType::Conditional,
            StrategyType::Composite,
            StrategyType::Versioned,
        ] {
            assert!(kinds.contains(&kind), "{kind} missing");
        }
    }
}
