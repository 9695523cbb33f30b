use std::fmt;
use std::sync::Arc;

use resource::Resource;
use serde_json::Value;

use super::PreservationStrategy;
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

pub type BranchPredicate = Arc<dyn Fn(&Resource, &FieldDescriptor) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ConditionalBranch {
    pub name: String,
    predicate: BranchPredicate,
    pub strategy: Arc<PreservationStrategy>,
}

impl ConditionalBranch {
    pub fn new<P>(name: impl Into<String>, predicate: P, strategy: Arc<PreservationStrategy>) -> Self
    where
        P: Fn(&Resource, &FieldDescriptor) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            strategy,
        }
    }
}

impl fmt::Debug for ConditionalBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalBranch")
            .field("name", &self.name)
            .field("strategy", &self.strategy.strategy_type())
            .finish_non_exhaustive()
    }
}

/// First branch whose predicate holds wins; the fallback covers the rest.
///
/// The record returned is the chosen branch's own, so `strategy_used`
/// names the inner strategy type. Restore selects the branch by that type
/// rather than re-running predicates, which may no longer hold once the
/// object has been converted.
#[derive(Debug, Clone, Default)]
pub struct ConditionalStrategy {
    branches: Vec<ConditionalBranch>,
    fallback: Option<Arc<PreservationStrategy>>,
}

impl ConditionalStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: ConditionalBranch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<PreservationStrategy>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub(crate) fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        let view: &Resource = object;
        let chosen = self
            .branches
            .iter()
            .find(|branch| (branch.predicate)(view, field))
            .map(|branch| (branch.name.as_str(), &branch.strategy));
        let (name, strategy) = match (chosen, &self.fallback) {
            (Some(hit), _) => hit,
            (None, Some(fallback)) => ("fallback", fallback),
            (None, None) => {
                return Err(PreservationError::NoStrategyMatched {
                    strategy: "conditional",
                    path: field.path.clone(),
                })
            }
        };

        Ok(strategy
            .apply(object, field)?
            .with_metadata("conditionalBranch", Value::String(name.to_string())))
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        let strategy = self
            .branches
            .iter()
            .map(|branch| &branch.strategy)
            .chain(self.fallback.iter())
            .find(|strategy| strategy.strategy_type() == preserved.strategy_used)
            .ok_or_else(|| PreservationError::NoStrategyMatched {
                strategy: "conditional",
                path: preserved.path().to_string(),
            })?;
        strategy.restore(object, preserved)
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.branches.is_empty() && self.fallback.is_none() {
            return Err(PreservationError::InvalidConfiguration(
                "conditional strategy needs at least one branch or a fallback".into(),
            ));
        }
        for branch in &self.branches {
            branch.strategy.validate()?;
        }
        if let Some(fallback) = &self.fallback {
            fallback.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{AnnotationStrategy, DeepCopyStrategy, StrategyType};
    use serde_json::json;

    fn size_routed() -> ConditionalStrategy {
        ConditionalStrategy::new()
            .with_branch(ConditionalBranch::new(
                "large",
                |_, field| field.size_bytes() > 16,
                Arc::new(AnnotationStrategy::new("base").into()),
            ))
            .with_fallback(Arc::new(DeepCopyStrategy::new().into()))
    }

    fn object() -> Resource {
        Resource::new("example.io/v1alpha1", "Widget", "default", "w")
    }

    #[test]
    fn first_matching_branch_wins() {
        let strategy = size_routed();
        let mut target = object();
        let big = FieldDescriptor::new("Spec.Blob", json!("x".repeat(32)));
        let preserved = strategy.apply(&mut target, &big).unwrap();
        assert_eq!(preserved.strategy_used, StrategyType::Annotation);
        assert_eq!(preserved.metadata_str("conditionalBranch"), Some("large"));

        let small = FieldDescriptor::new("Spec.Name", json!("w"));
        let preserved = strategy.apply(&mut target, &small).unwrap();
        assert_eq!(preserved.strategy_used, StrategyType::DeepCopy);
        assert_eq!(preserved.metadata_str("conditionalBranch"), Some("fallback"));
    }

    #[test]
    fn restore_uses_recorded_type_not_predicate() {
        let strategy = size_routed();
        let mut target = object();
        let value = json!("x".repeat(32));
        let preserved = strategy
            .apply(&mut target, &FieldDescriptor::new("Spec.Blob", value.clone()))
            .unwrap();

        // Predicate would now pick the fallback; restore must still use the annotation.
        let mut record = preserved.clone();
        record.descriptor.value = json!("");
        strategy.restore(&mut target, &record).unwrap();
        assert_eq!(target.get_field("Spec.Blob").unwrap(), Some(&value));
        assert!(target.annotation("base/spec-blob").is_none());
    }

    #[test]
    fn no_branch_and_no_fallback() {
        let strategy = ConditionalStrategy::new().with_branch(ConditionalBranch::new(
            "never",
            |_, _| false,
            Arc::new(DeepCopyStrategy::new().into()),
        ));
        let err = strategy
            .apply(&mut object(), &FieldDescriptor::new("Spec.A", json!(1)))
            .unwrap_err();
        assert!(matches!(err, PreservationError::NoStrategyMatched { .. }));
        assert!(ConditionalStrategy::new().validate().is_err());
    }
}
