use std::fmt;
use std::sync::Arc;

use resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{expect_type, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Result<Value, String> + Send + Sync>;

/// How restore reconciles the preserved value with the field's current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Preserved value replaces the current one.
    #[default]
    SourceWins,
    /// Current value is kept.
    TargetWins,
    /// `merge_fn(preserved, current)` is written.
    Merge,
    /// Differing values fail with `MergeConflict`.
    Error,
}

/// Stores the value verbatim; merging happens at restore time.
#[derive(Clone, Default)]
pub struct MergeStrategy {
    resolution: ConflictResolution,
    merge_fn: Option<MergeFn>,
}

impl MergeStrategy {
    pub fn new<M>(resolution: ConflictResolution, merge_fn: M) -> Self
    where
        M: Fn(&Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            resolution,
            merge_fn: Some(Arc::new(merge_fn)),
        }
    }

    /// Recursive object merge where preserved keys win.
    pub fn deep_merge(resolution: ConflictResolution) -> Self {
        Self::new(resolution, |preserved, current| {
            Ok(json_deep_merge(current, preserved))
        })
    }

    pub fn without_merge_fn(resolution: ConflictResolution) -> Self {
        Self {
            resolution,
            merge_fn: None,
        }
    }

    pub fn resolution(&self) -> ConflictResolution {
        self.resolution
    }

    pub(crate) fn apply(&self, field: &FieldDescriptor) -> Result<PreservedField, PreservationError> {
        Ok(PreservedField::new(field, field.value.clone(), StrategyType::Merge)
            .with_metadata("resolution", serde_json::to_value(self.resolution)?))
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        expect_type(preserved, StrategyType::Merge)?;
        let path = preserved.path();
        let source = &preserved.original_value;
        let current = object.get_field(path)?.filter(|v| !v.is_null()).cloned();

        let Some(current) = current else {
            object.set_field(path, source.clone())?;
            return Ok(());
        };

        let merged = match self.resolution {
            ConflictResolution::SourceWins => source.clone(),
            ConflictResolution::TargetWins => current,
            ConflictResolution::Merge => {
                let merge_fn = self.merge_fn.as_ref().ok_or_else(missing_merge_fn)?;
                merge_fn(source, &current).map_err(|reason| PreservationError::TransformFailed {
                    path: path.to_string(),
                    reason,
                })?
            }
            ConflictResolution::Error => {
                if &current != source {
                    return Err(PreservationError::MergeConflict {
                        path: path.to_string(),
                    });
                }
                current
            }
        };
        object.set_field(path, merged)?;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.merge_fn.is_none() {
            return Err(missing_merge_fn());
        }
        Ok(())
    }
}

fn missing_merge_fn() -> PreservationError {
    PreservationError::InvalidConfiguration("merge strategy requires a merge function".into())
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeStrategy")
            .field("resolution", &self.resolution)
            .field("merge_fn", &self.merge_fn.is_some())
            .finish()
    }
}

/// Merge `overlay` into `base`: objects merge key by key, anything else is
/// replaced by the overlay.
pub fn json_deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = match merged.get(key) {
                    Some(existing) => json_deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}
