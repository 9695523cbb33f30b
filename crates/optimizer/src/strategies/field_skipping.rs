use resource::Resource;
use serde_json::Value;
use tracing::debug;

use super::OptimizationStrategy;
use crate::error::OptimizeError;

/// Server-managed metadata that never needs converting.
const SKIPPED_METADATA: [&str; 4] = ["managedFields", "selfLink", "initializers", "clusterName"];

/// Drops server-managed metadata and an empty `status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldSkippingStrategy;

impl OptimizationStrategy for FieldSkippingStrategy {
    fn name(&self) -> &'static str {
        "field-skipping"
    }

    fn can_optimize(&self, object: &Resource, _target_version: &str) -> bool {
        let metadata = object.as_value().get("metadata");
        SKIPPED_METADATA
            .iter()
            .any(|key| metadata.and_then(|m| m.get(key)).is_some())
            || empty_status(object)
    }

    fn optimize(&self, object: &mut Resource, _target_version: &str) -> Result<(), OptimizeError> {
        let mut removed = 0;
        for key in SKIPPED_METADATA {
            if object.remove_field(&format!("metadata.{key}"))?.is_some() {
                removed += 1;
            }
        }
        if empty_status(object) {
            object.remove_field("status")?;
            removed += 1;
        }
        debug!(resource = %object.reference(), removed, "fields_skipped");
        Ok(())
    }
}

fn empty_status(object: &Resource) -> bool {
    object
        .status()
        .and_then(Value::as_object)
        .is_some_and(|status| status.is_empty())
}
