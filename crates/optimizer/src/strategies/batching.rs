use dashmap::DashMap;
use resource::Resource;
use tracing::debug;

use super::{marker, OptimizationStrategy};
use crate::error::OptimizeError;

/// Counts conversions per `kind:target` and marks an object batch-eligible
/// once another object of the same kind has been seen for that target.
#[derive(Debug, Default)]
pub struct BatchingStrategy {
    seen: DashMap<String, u64>,
}

impl BatchingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, kind: &str, target_version: &str) -> u64 {
        self.seen
            .get(&group_key(kind, target_version))
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl OptimizationStrategy for BatchingStrategy {
    fn name(&self) -> &'static str {
        "batching"
    }

    /// Records the sighting; true from the second object of a group on.
    fn can_optimize(&self, object: &Resource, target_version: &str) -> bool {
        let mut count = self
            .seen
            .entry(group_key(object.kind(), target_version))
            .or_insert(0);
        *count += 1;
        *count > 1
    }

    fn optimize(&self, object: &mut Resource, target_version: &str) -> Result<(), OptimizeError> {
        object.set_annotation(marker("batch-eligible"), "true");
        debug!(resource = %object.reference(), target = target_version, "batch_eligible");
        Ok(())
    }
}

fn group_key(kind: &str, target_version: &str) -> String {
    format!("{kind}:{target_version}")
}
