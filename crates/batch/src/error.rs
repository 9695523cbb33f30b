use optimizer::OptimizeError;
use preservation::PreservationError;
use resource::{FieldPathError, MapperError, StoreError};
use thiserror::Error;

use crate::types::BatchConversionResult;

/// Why one resource could not be converted. The batch worker retries it up
/// to the ceiling, then reports the resource `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConversionError {
    #[error("unsupported target version `{target}` for {api_version}")]
    UnsupportedTarget { api_version: String, target: String },
    #[error("preserving `{path}` failed: {source}")]
    Preservation {
        path: String,
        #[source]
        source: PreservationError,
    },
    #[error("restoring `{path}` failed: {source}")]
    Restore {
        path: String,
        #[source]
        source: PreservationError,
    },
    #[error(transparent)]
    Mapping(#[from] MapperError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

/// Aggregate outcome of a batch that did not fully succeed.
///
/// Both variants carry every result collected, so callers can react per
/// resource instead of treating the batch as a total failure.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BatchError {
    #[error("{failed} of {total} resources failed to convert")]
    Failures {
        failed: usize,
        total: usize,
        results: Vec<BatchConversionResult>,
    },
    #[error("batch aborted ({reason}) after {collected} of {total} results; {failed} failed")]
    Aborted {
        reason: resource::ContextError,
        failed: usize,
        collected: usize,
        total: usize,
        results: Vec<BatchConversionResult>,
    },
    #[error("listing resources failed: {0}")]
    List(#[from] StoreError),
    #[error("invalid batch configuration: {0}")]
    InvalidConfig(String),
}

impl BatchError {
    /// Results gathered before the error was raised.
    pub fn results(&self) -> &[BatchConversionResult] {
        match self {
            BatchError::Failures { results, .. } | BatchError::Aborted { results, .. } => results,
            BatchError::List(_) | BatchError::InvalidConfig(_) => &[],
        }
    }

    pub fn into_results(self) -> Vec<BatchConversionResult> {
        match self {
            BatchError::Failures { results, .. } | BatchError::Aborted { results, .. } => results,
            BatchError::List(_) | BatchError::InvalidConfig(_) => Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            BatchError::Failures { failed, .. } | BatchError::Aborted { failed, .. } => *failed,
            BatchError::List(_) | BatchError::InvalidConfig(_) => 0,
        }
    }
}
