use resource::Resource;
use serde_json::{Map, Value};

use super::{expect_type, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

/// Recursive clone bounded by `max_depth`.
///
/// Object keys starting with `_` are private and dropped from the copy
/// unless `include_private` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepCopyStrategy {
    pub max_depth: usize,
    pub include_private: bool,
}

impl Default for DeepCopyStrategy {
    fn default() -> Self {
        Self {
            max_depth: 32,
            include_private: false,
        }
    }
}

impl DeepCopyStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_include_private(mut self, include: bool) -> Self {
        self.include_private = include;
        self
    }

    pub(crate) fn apply(&self, field: &FieldDescriptor) -> Result<PreservedField, PreservationError> {
        let copy = self.copy_value(&field.value, 0, &field.path)?;
        Ok(PreservedField::new(field, copy, StrategyType::DeepCopy)
            .with_metadata("maxDepth", Value::from(self.max_depth)))
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        expect_type(preserved, StrategyType::DeepCopy)?;
        if !preserved.verify(&preserved.original_value) {
            return Err(PreservationError::RestoreValidationFailed {
                path: preserved.path().to_string(),
                reason: "checksum mismatch".into(),
            });
        }
        object.set_field(preserved.path(), preserved.original_value.clone())?;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.max_depth == 0 {
            return Err(PreservationError::InvalidConfiguration(
                "deep-copy max_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn copy_value(&self, value: &Value, depth: usize, path: &str) -> Result<Value, PreservationError> {
        match value {
            Value::Object(map) => {
                self.check_depth(depth, path)?;
                let mut copy = Map::new();
                for (key, child) in map {
                    if !self.include_private && key.starts_with('_') {
                        continue;
                    }
                    copy.insert(key.clone(), self.copy_value(child, depth + 1, path)?);
                }
                Ok(Value::Object(copy))
            }
            Value::Array(items) => {
                self.check_depth(depth, path)?;
                items
                    .iter()
                    .map(|item| self.copy_value(item, depth + 1, path))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            scalar => Ok(scalar.clone()),
        }
    }

    fn check_depth(&self, depth: usize, path: &str) -> Result<(), PreservationError> {
        if depth >= self.max_depth {
            return Err(PreservationError::DepthExceeded {
                path: path.to_string(),
                max_depth: self.max_depth,
            });
        }
        Ok(())
    }
}
