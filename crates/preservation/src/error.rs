//! Error surface for strategy registration, policy matching, and
//! apply/restore.
//!
//! | Error | Permanence | Raised by |
//! |-------|------------|-----------|
//! | [`DuplicateStrategy`](PreservationError::DuplicateStrategy), [`DuplicatePolicy`](PreservationError::DuplicatePolicy) | permanent, caller bug | registration |
//! | [`InvalidPolicy`](PreservationError::InvalidPolicy), [`InvalidConfiguration`](PreservationError::InvalidConfiguration) | permanent | registration / `validate` |
//! | [`NotFound`](PreservationError::NotFound) | permanent for configuration | registry lookup, restore |
//! | [`DepthExceeded`](PreservationError::DepthExceeded), [`TypeMismatch`](PreservationError::TypeMismatch) | permanent for the field | apply, condition evaluation |
//! | [`RestoreValidationFailed`](PreservationError::RestoreValidationFailed) | permanent, data integrity | restore |

use resource::FieldPathError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PreservationError {
    #[error("strategy `{0}` is already registered")]
    DuplicateStrategy(String),
    #[error("policy `{0}` is already registered")]
    DuplicatePolicy(String),
    #[error("invalid policy `{policy}`: {reason}")]
    InvalidPolicy { policy: String, reason: String },
    #[error("invalid strategy configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },
    #[error("value at `{path}` nests deeper than {max_depth} levels")]
    DepthExceeded { path: String, max_depth: usize },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("restored value for `{path}` failed validation: {reason}")]
    RestoreValidationFailed { path: String, reason: String },
    #[error("validation failed for `{path}`: {reason}")]
    ValidationFailed { path: String, reason: String },
    #[error("transform failed for `{path}`: {reason}")]
    TransformFailed { path: String, reason: String },
    #[error("merge conflict at `{path}`: preserved and current values differ")]
    MergeConflict { path: String },
    #[error("no branch of `{strategy}` applies to `{path}`")]
    NoStrategyMatched { strategy: &'static str, path: String },
    #[error("annotation `{0}` is missing from the object")]
    MissingAnnotation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

impl PreservationError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        PreservationError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn invalid_policy(policy: &str, reason: impl Into<String>) -> Self {
        PreservationError::InvalidPolicy {
            policy: policy.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for PreservationError {
    fn from(err: serde_json::Error) -> Self {
        PreservationError::Serialization(err.to_string())
    }
}
