use thiserror::Error;

use crate::context::ContextError;
use crate::object::ResourceRef;

/// Errors raised while parsing or walking a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldPathError {
    #[error("field path is empty")]
    Empty,
    #[error("malformed field path `{path}`: {reason}")]
    Malformed { path: String, reason: String },
    #[error("cannot descend into `{segment}` of `{path}`: parent is not an object")]
    NotAnObject { path: String, segment: String },
    #[error("cannot index `{path}` at [{index}]: parent is not an array")]
    NotAnArray { path: String, index: usize },
    #[error("index {index} out of bounds for `{path}` (len {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
    #[error("resource must be a JSON object")]
    NotAResource,
}

/// Errors returned by a [`ResourceStore`](crate::ResourceStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceRef),
    #[error("update conflict on {reference}: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        reference: ResourceRef,
        expected: String,
        actual: String,
    },
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store call aborted: {0}")]
    Context(#[from] ContextError),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StoreError::Transient(msg.into())
    }

    /// Conflicts and transient failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors returned by field mappers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    #[error("no field mapper registered between {from} and {to}")]
    NoMapper { from: String, to: String },
    #[error("field mapping failed: {0}")]
    Mapping(String),
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let reference = ResourceRef::new("Widget", "default", "a");
        assert!(StoreError::Conflict {
            reference: reference.clone(),
            expected: "1".into(),
            actual: "2".into(),
        }
        .is_retryable());
        assert!(StoreError::transient("connection reset").is_retryable());
        assert!(!StoreError::NotFound(reference).is_retryable());
        assert!(!StoreError::backend("disk full").is_retryable());
        assert!(!StoreError::Context(ContextError::Cancelled).is_retryable());
    }

    #[test]
    fn error_messages_name_the_resource() {
        let err = StoreError::NotFound(ResourceRef::new("Widget", "prod", "api"));
        assert!(err.to_string().contains("Widget prod/api"));

        let err = MapperError::NoMapper {
            from: "v1alpha1".into(),
            to: "v1beta1".into(),
        };
        assert!(err.to_string().contains("v1alpha1"));
        assert!(err.to_string().contains("v1beta1"));
    }
}
