use std::fmt;
use std::sync::Arc;

use resource::Resource;
use serde_json::Value;

use super::{expect_type, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField, TRANSFORMED_KEY};

pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Stores `forward(value)`; restore recovers the value with `inverse` and
/// checks it against the apply-time checksum and the optional validator.
#[derive(Clone, Default)]
pub struct TransformStrategy {
    forward: Option<TransformFn>,
    inverse: Option<TransformFn>,
    validator: Option<ValidatorFn>,
}

impl TransformStrategy {
    pub fn new<F, I>(forward: F, inverse: I) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
        I: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            forward: Some(Arc::new(forward)),
            inverse: Some(Arc::new(inverse)),
            validator: None,
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Encodes any value as its JSON text; the inverse parses it back.
    pub fn json_string() -> Self {
        Self::new(
            |value| serde_json::to_string(value).map(Value::String).map_err(|e| e.to_string()),
            |value| match value {
                Value::String(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
                other => Err(format!("expected a JSON string, found {other}")),
            },
        )
    }

    pub(crate) fn apply(&self, field: &FieldDescriptor) -> Result<PreservedField, PreservationError> {
        let forward = self.forward.as_ref().ok_or_else(missing_functions)?;
        if let Some(validator) = &self.validator {
            validator(&field.value).map_err(|reason| PreservationError::ValidationFailed {
                path: field.path.clone(),
                reason,
            })?;
        }
        let transformed = forward(&field.value).map_err(|reason| PreservationError::TransformFailed {
            path: field.path.clone(),
            reason,
        })?;
        Ok(PreservedField::new(field, field.value.clone(), StrategyType::Transform)
            .with_metadata(TRANSFORMED_KEY, transformed))
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        expect_type(preserved, StrategyType::Transform)?;
        let inverse = self.inverse.as_ref().ok_or_else(missing_functions)?;
        let path = preserved.path().to_string();
        let transformed = preserved.metadata.get(TRANSFORMED_KEY).ok_or_else(|| {
            PreservationError::RestoreValidationFailed {
                path: path.clone(),
                reason: "transformed value missing from preserved record".into(),
            }
        })?;

        let recovered = inverse(transformed).map_err(|reason| PreservationError::RestoreValidationFailed {
            path: path.clone(),
            reason: format!("inverse transform failed: {reason}"),
        })?;
        if let Some(validator) = &self.validator {
            validator(&recovered).map_err(|reason| PreservationError::RestoreValidationFailed {
                path: path.clone(),
                reason,
            })?;
        }
        if !preserved.verify(&recovered) {
            return Err(PreservationError::RestoreValidationFailed {
                path,
                reason: "inverse transform does not reproduce the original value".into(),
            });
        }

        object.set_field(preserved.path(), recovered)?;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.forward.is_none() || self.inverse.is_none() {
            return Err(missing_functions());
        }
        Ok(())
    }
}

fn missing_functions() -> PreservationError {
    PreservationError::InvalidConfiguration(
        "transform strategy requires both a forward and an inverse function".into(),
    )
}

impl fmt::Debug for TransformStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStrategy")
            .field("forward", &self.forward.is_some())
            .field("inverse", &self.inverse.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
