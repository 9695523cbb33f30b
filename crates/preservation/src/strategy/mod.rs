//! Preservation strategies.
//!
//! The set of strategies is closed: [`PreservationStrategy`] is an enum and
//! every operation dispatches with an exhaustive `match`. Variants hold
//! their configuration; none keep per-conversion state, so one instance can
//! serve many workers concurrently.

mod annotation;
mod composite;
mod conditional;
mod deep_copy;
mod merge;
mod transform;
mod versioned;

use std::fmt;

use resource::Resource;
use serde::{Deserialize, Serialize};

use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

pub use annotation::{AnnotationStrategy, Cipher};
pub use composite::{CompositeMode, CompositeStrategy};
pub use conditional::{ConditionalBranch, ConditionalStrategy};
pub use deep_copy::DeepCopyStrategy;
pub use merge::{json_deep_merge, ConflictResolution, MergeStrategy};
pub use transform::TransformStrategy;
pub use versioned::{VersionedStrategy, DEFAULT_ROUTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    DeepCopy,
    Transform,
    Merge,
    Annotation,
    Conditional,
    Composite,
    Versioned,
}

impl StrategyType {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyType::DeepCopy => "deep-copy",
            StrategyType::Transform => "transform",
            StrategyType::Merge => "merge",
            StrategyType::Annotation => "annotation",
            StrategyType::Conditional => "conditional",
            StrategyType::Composite => "composite",
            StrategyType::Versioned => "versioned",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum PreservationStrategy {
    DeepCopy(DeepCopyStrategy),
    Transform(TransformStrategy),
    Merge(MergeStrategy),
    Annotation(AnnotationStrategy),
    Conditional(ConditionalStrategy),
    Composite(CompositeStrategy),
    Versioned(VersionedStrategy),
}

impl PreservationStrategy {
    /// Capture `field` so it can be written back after conversion.
    ///
    /// Only the annotation strategy touches `object` here (it writes the
    /// side-channel annotation); the others read it at most.
    pub fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        match self {
            PreservationStrategy::DeepCopy(s) => s.apply(field),
            PreservationStrategy::Transform(s) => s.apply(field),
            PreservationStrategy::Merge(s) => s.apply(field),
            PreservationStrategy::Annotation(s) => s.apply(object, field),
            PreservationStrategy::Conditional(s) => s.apply(object, field),
            PreservationStrategy::Composite(s) => s.apply(object, field),
            PreservationStrategy::Versioned(s) => s.apply(object, field),
        }
    }

    /// Write a preserved field back into `object` at its original path.
    pub fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        match self {
            PreservationStrategy::DeepCopy(s) => s.restore(object, preserved),
            PreservationStrategy::Transform(s) => s.restore(object, preserved),
            PreservationStrategy::Merge(s) => s.restore(object, preserved),
            PreservationStrategy::Annotation(s) => s.restore(object, preserved),
            PreservationStrategy::Conditional(s) => s.restore(object, preserved),
            PreservationStrategy::Composite(s) => s.restore(object, preserved),
            PreservationStrategy::Versioned(s) => s.restore(object, preserved),
        }
    }

    /// Reject incomplete configuration; called on registration.
    pub fn validate(&self) -> Result<(), PreservationError> {
        match self {
            PreservationStrategy::DeepCopy(s) => s.validate(),
            PreservationStrategy::Transform(s) => s.validate(),
            PreservationStrategy::Merge(s) => s.validate(),
            PreservationStrategy::Annotation(s) => s.validate(),
            PreservationStrategy::Conditional(s) => s.validate(),
            PreservationStrategy::Composite(s) => s.validate(),
            PreservationStrategy::Versioned(s) => s.validate(),
        }
    }

    pub fn strategy_type(&self) -> StrategyType {
        match self {
            PreservationStrategy::DeepCopy(_) => StrategyType::DeepCopy,
            PreservationStrategy::Transform(_) => StrategyType::Transform,
            PreservationStrategy::Merge(_) => StrategyType::Merge,
            PreservationStrategy::Annotation(_) => StrategyType::Annotation,
            PreservationStrategy::Conditional(_) => StrategyType::Conditional,
            PreservationStrategy::Composite(_) => StrategyType::Composite,
            PreservationStrategy::Versioned(_) => StrategyType::Versioned,
        }
    }
}

impl From<DeepCopyStrategy> for PreservationStrategy {
    fn from(s: DeepCopyStrategy) -> Self {
        PreservationStrategy::DeepCopy(s)
    }
}

impl From<TransformStrategy> for PreservationStrategy {
    fn from(s: TransformStrategy) -> Self {
        PreservationStrategy::Transform(s)
    }
}

impl From<MergeStrategy> for PreservationStrategy {
    fn from(s: MergeStrategy) -> Self {
        PreservationStrategy::Merge(s)
    }
}

impl From<AnnotationStrategy> for PreservationStrategy {
    fn from(s: AnnotationStrategy) -> Self {
        PreservationStrategy::Annotation(s)
    }
}

impl From<ConditionalStrategy> for PreservationStrategy {
    fn from(s: ConditionalStrategy) -> Self {
        PreservationStrategy::Conditional(s)
    }
}

impl From<CompositeStrategy> for PreservationStrategy {
    fn from(s: CompositeStrategy) -> Self {
        PreservationStrategy::Composite(s)
    }
}

impl From<VersionedStrategy> for PreservationStrategy {
    fn from(s: VersionedStrategy) -> Self {
        PreservationStrategy::Versioned(s)
    }
}

/// Check that a record reached the strategy kind that produced it.
pub(crate) fn expect_type(
    preserved: &PreservedField,
    expected: StrategyType,
) -> Result<(), PreservationError> {
    if preserved.strategy_used == expected {
        Ok(())
    } else {
        Err(PreservationError::TypeMismatch(format!(
            "`{}` was preserved by {}, not {}",
            preserved.path(),
            preserved.strategy_used,
            expected
        )))
    }
}
