use std::sync::Arc;

use resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{PreservationStrategy, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositeMode {
    /// Apply each member in turn and keep the last record.
    #[default]
    Sequential,
    /// Apply every member independently; sub-records keyed by member name.
    Parallel,
    /// Feed each member's output value into the next member.
    Pipeline,
}

/// N named member strategies combined under one [`CompositeMode`].
#[derive(Debug, Clone, Default)]
pub struct CompositeStrategy {
    mode: CompositeMode,
    members: Vec<(String, Arc<PreservationStrategy>)>,
}

const MEMBER_META: &str = "compositeMember";
const STAGES_META: &str = "pipelineStages";

impl CompositeStrategy {
    pub fn new(mode: CompositeMode) -> Self {
        Self {
            mode,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, name: impl Into<String>, strategy: Arc<PreservationStrategy>) -> Self {
        self.members.push((name.into(), strategy));
        self
    }

    pub fn mode(&self) -> CompositeMode {
        self.mode
    }

    pub(crate) fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        match self.mode {
            CompositeMode::Sequential => {
                let mut last = None;
                for (name, strategy) in &self.members {
                    let record = strategy
                        .apply(object, field)?
                        .with_metadata(MEMBER_META, Value::String(name.clone()));
                    last = Some(record);
                }
                last.ok_or_else(empty_members)
            }
            CompositeMode::Parallel => {
                let mut bundle = PreservedField::new(field, field.value.clone(), StrategyType::Composite)
                    .with_metadata("mode", Value::String("parallel".into()));
                for (name, strategy) in &self.members {
                    bundle
                        .components
                        .insert(name.clone(), strategy.apply(object, field)?);
                }
                Ok(bundle)
            }
            CompositeMode::Pipeline => {
                let mut bundle = PreservedField::new(field, field.value.clone(), StrategyType::Composite)
                    .with_metadata("mode", Value::String("pipeline".into()));
                let mut stage_input = field.clone();
                let mut order = Vec::with_capacity(self.members.len());
                for (name, strategy) in &self.members {
                    let record = strategy.apply(object, &stage_input)?;
                    stage_input = field.with_value(record.output_value().clone());
                    order.push(Value::String(name.clone()));
                    bundle.components.insert(name.clone(), record);
                }
                Ok(bundle.with_metadata(STAGES_META, Value::Array(order)))
            }
        }
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        match self.mode {
            CompositeMode::Sequential => self.restore_sequential(object, preserved),
            // Reverse declaration order: the first member's value lands last,
            // and pipeline stages unwind from the final stage back.
            CompositeMode::Parallel | CompositeMode::Pipeline => {
                for (name, strategy) in self.members.iter().rev() {
                    let record = self.component(preserved, name)?;
                    strategy.restore(object, record)?;
                }
                Ok(())
            }
        }
    }

    fn restore_sequential(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        // The member that produced the record is recorded; fall back to the
        // members whose type matches, newest first.
        if let Some(member) = preserved.metadata_str(MEMBER_META) {
            if let Some((_, strategy)) = self.members.iter().find(|(name, _)| name == member) {
                return strategy.restore(object, preserved);
            }
        }

        let mut last_err = None;
        for (name, strategy) in self.members.iter().rev() {
            if strategy.strategy_type() != preserved.strategy_used {
                continue;
            }
            match strategy.restore(object, preserved) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(member = %name, error = %err, "composite_member_restore_failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PreservationError::NoStrategyMatched {
            strategy: "composite",
            path: preserved.path().to_string(),
        }))
    }

    fn component<'a>(
        &self,
        preserved: &'a PreservedField,
        name: &str,
    ) -> Result<&'a PreservedField, PreservationError> {
        preserved
            .components
            .get(name)
            .ok_or_else(|| PreservationError::not_found("composite component", name))
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.members.is_empty() {
            return Err(empty_members());
        }
        let mut seen = std::collections::BTreeSet::new();
        for (name, strategy) in &self.members {
            if !seen.insert(name.as_str()) {
                return Err(PreservationError::InvalidConfiguration(format!(
                    "composite member `{name}` appears twice"
                )));
            }
            strategy.validate()?;
        }
        Ok(())
    }
}

fn empty_members() -> PreservationError {
    PreservationError::InvalidConfiguration("composite strategy has no members".into())
}
