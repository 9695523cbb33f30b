use std::sync::Arc;

use regex::Regex;
use resource::Resource;
use serde_json::Value;

use super::{expect_type, PreservationStrategy, StrategyType};
use crate::error::PreservationError;
use crate::field::{FieldDescriptor, PreservedField};

/// Marker stored as `versionPattern` when the default route was taken.
pub const DEFAULT_ROUTE: &str = "__default__";

const PATTERN_META: &str = "versionPattern";
const ROUTE_COMPONENT: &str = "route";

#[derive(Debug, Clone)]
struct VersionRoute {
    pattern: String,
    regex: Regex,
    strategy: Arc<PreservationStrategy>,
}

/// Routes by regex over the object's schema version (`v1alpha1`).
///
/// The matched pattern is always recorded in the preserved field's
/// metadata. Restore routes by that recorded pattern, since the object's
/// version has changed by then.
#[derive(Debug, Clone, Default)]
pub struct VersionedStrategy {
    routes: Vec<VersionRoute>,
    default: Option<Arc<PreservationStrategy>>,
}

impl VersionedStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(
        mut self,
        pattern: &str,
        strategy: Arc<PreservationStrategy>,
    ) -> Result<Self, PreservationError> {
        let regex = Regex::new(pattern).map_err(|e| {
            PreservationError::InvalidConfiguration(format!("version pattern `{pattern}`: {e}"))
        })?;
        self.routes.push(VersionRoute {
            pattern: pattern.to_string(),
            regex,
            strategy,
        });
        Ok(self)
    }

    pub fn with_default(mut self, strategy: Arc<PreservationStrategy>) -> Self {
        self.default = Some(strategy);
        self
    }

    pub(crate) fn apply(
        &self,
        object: &mut Resource,
        field: &FieldDescriptor,
    ) -> Result<PreservedField, PreservationError> {
        let version = object.version().to_string();
        let (pattern, strategy) = match self.routes.iter().find(|r| r.regex.is_match(&version)) {
            Some(route) => (route.pattern.as_str(), &route.strategy),
            None => match &self.default {
                Some(default) => (DEFAULT_ROUTE, default),
                None => {
                    return Err(PreservationError::NoStrategyMatched {
                        strategy: "versioned",
                        path: field.path.clone(),
                    })
                }
            },
        };

        let inner = strategy.apply(object, field)?;
        let mut record = PreservedField::new(field, field.value.clone(), StrategyType::Versioned)
            .with_metadata(PATTERN_META, Value::String(pattern.to_string()))
            .with_metadata("sourceVersion", Value::String(version));
        record.components.insert(ROUTE_COMPONENT.to_string(), inner);
        Ok(record)
    }

    pub(crate) fn restore(
        &self,
        object: &mut Resource,
        preserved: &PreservedField,
    ) -> Result<(), PreservationError> {
        expect_type(preserved, StrategyType::Versioned)?;
        let pattern = preserved.metadata_str(PATTERN_META).ok_or_else(|| {
            PreservationError::RestoreValidationFailed {
                path: preserved.path().to_string(),
                reason: format!("preserved record carries no `{PATTERN_META}`"),
            }
        })?;
        let route = if pattern == DEFAULT_ROUTE {
            self.default.as_ref()
        } else {
            self.routes
                .iter()
                .find(|route| route.pattern == pattern)
                .map(|route| &route.strategy)
        };
        let strategy =
            route.ok_or_else(|| PreservationError::not_found("version route", pattern))?;

        let inner = preserved
            .components
            .get(ROUTE_COMPONENT)
            .ok_or_else(|| PreservationError::not_found("versioned component", ROUTE_COMPONENT))?;
        strategy.restore(object, inner)
    }

    pub(crate) fn validate(&self) -> Result<(), PreservationError> {
        if self.routes.is_empty() && self.default.is_none() {
            return Err(PreservationError::InvalidConfiguration(
                "versioned strategy needs at least one route or a default".into(),
            ));
        }
        for route in &self.routes {
            route.strategy.validate()?;
        }
        if let Some(default) = &self.default {
            default.validate()?;
        }
        Ok(())
    }
}
