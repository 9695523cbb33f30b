use resource::FieldPathError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache capacity must be at least 1")]
    ZeroCapacity,
    #[error("entry of {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge { size: usize, max: usize },
    #[error("failed to start cache sweeper: {0}")]
    Sweeper(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum OptimizeError {
    #[error("codec error on `{field}`: {reason}")]
    Codec { field: String, reason: String },
    #[error("lazy reference `{0}` has no stored value")]
    UnresolvedReference(String),
    #[error("component `{name}` failed to convert: {reason}")]
    Component { name: String, reason: String },
    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

impl OptimizeError {
    pub(crate) fn codec(field: &str, reason: impl ToString) -> Self {
        OptimizeError::Codec {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
