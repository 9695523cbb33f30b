use std::collections::BTreeMap;
use std::sync::Mutex;

use resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use super::{ActionType, PolicyAction};
use crate::error::PreservationError;
use crate::field::{value_size, FieldDescriptor};

/// Alert raised by an `alert` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAlert {
    pub policy: String,
    pub rule: String,
    pub field: String,
    pub object: String,
    pub message: String,
    pub severity: String,
}

/// Destination for `metric` and `alert` actions.
///
/// Injected into the [`PolicyManager`](super::PolicyManager); nothing is
/// published through process-global state.
pub trait PreservationEvents: Send + Sync {
    fn record_metric(&self, name: &str, value: f64, labels: &BTreeMap<String, String>);
    fn raise_alert(&self, alert: &PolicyAlert);
}

/// Emits events as tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl PreservationEvents for TracingEvents {
    fn record_metric(&self, name: &str, value: f64, labels: &BTreeMap<String, String>) {
        info!(metric = name, value, labels = ?labels, "preservation_metric");
    }

    fn raise_alert(&self, alert: &PolicyAlert) {
        warn!(
            policy = %alert.policy,
            rule = %alert.rule,
            field = %alert.field,
            object = %alert.object,
            severity = %alert.severity,
            "{}",
            alert.message
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Metric {
        name: String,
        value: f64,
        labels: BTreeMap<String, String>,
    },
    Alert(PolicyAlert),
}

/// Keeps every event in memory. Useful in tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<PolicyEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<PolicyEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: PolicyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl PreservationEvents for RecordingEvents {
    fn record_metric(&self, name: &str, value: f64, labels: &BTreeMap<String, String>) {
        self.push(PolicyEvent::Metric {
            name: name.to_string(),
            value,
            labels: labels.clone(),
        });
    }

    fn raise_alert(&self, alert: &PolicyAlert) {
        self.push(PolicyEvent::Alert(alert.clone()));
    }
}

/// Where an action runs: the winning rule and the field it matched.
pub(crate) struct ActionScope<'a> {
    pub(crate) policy: &'a str,
    pub(crate) rule: &'a str,
    pub(crate) object: &'a Resource,
}

/// Run one action. Only `annotate` writes, and only into `field.annotations`.
pub(crate) fn execute(
    kind: ActionType,
    action: &PolicyAction,
    scope: &ActionScope<'_>,
    field: &mut FieldDescriptor,
    events: &dyn PreservationEvents,
) -> Result<(), PreservationError> {
    match kind {
        ActionType::Log => {
            let message = value_text(&action.value);
            let level = action.metadata.get("level").map(String::as_str).unwrap_or("info");
            let (policy, rule, path) = (scope.policy, scope.rule, field.path.as_str());
            match level {
                "trace" => trace!(policy, rule, field = path, "{message}"),
                "debug" => debug!(policy, rule, field = path, "{message}"),
                "warn" => warn!(policy, rule, field = path, "{message}"),
                "error" => error!(policy, rule, field = path, "{message}"),
                _ => info!(policy, rule, field = path, "{message}"),
            }
            Ok(())
        }
        ActionType::Metric => {
            let name = if action.target.is_empty() {
                "preservation_policy_matches"
            } else {
                action.target.as_str()
            };
            let value = match &action.value {
                Value::Null => 1.0,
                Value::Number(n) => n.as_f64().unwrap_or(1.0),
                other => {
                    return Err(PreservationError::TypeMismatch(format!(
                        "metric value must be numeric, got {other}"
                    )))
                }
            };
            let mut labels = action.metadata.clone();
            labels.insert("policy".into(), scope.policy.to_string());
            labels.insert("rule".into(), scope.rule.to_string());
            labels.insert("field".into(), field.path.clone());
            events.record_metric(name, value, &labels);
            Ok(())
        }
        ActionType::Alert => {
            let severity = action
                .metadata
                .get("severity")
                .cloned()
                .unwrap_or_else(|| "warning".into());
            events.raise_alert(&PolicyAlert {
                policy: scope.policy.to_string(),
                rule: scope.rule.to_string(),
                field: field.path.clone(),
                object: scope.object.reference().to_string(),
                message: value_text(&action.value),
                severity,
            });
            Ok(())
        }
        ActionType::Annotate => {
            if action.target.trim().is_empty() {
                return Err(PreservationError::InvalidConfiguration(
                    "annotate action needs a target key".into(),
                ));
            }
            field
                .annotations
                .insert(action.target.clone(), value_text(&action.value));
            Ok(())
        }
        ActionType::Validate => validate_field(action, field),
    }
}

fn validate_field(action: &PolicyAction, field: &FieldDescriptor) -> Result<(), PreservationError> {
    let failed = |reason: String| PreservationError::ValidationFailed {
        path: field.path.clone(),
        reason,
    };
    match action.target.as_str() {
        "not-null" if field.value.is_null() => Err(failed("value is null".into())),
        "not-empty" => {
            let empty = match &field.value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if empty {
                Err(failed("value is empty".into()))
            } else {
                Ok(())
            }
        }
        "max-size" => {
            let limit = action.value.as_u64().ok_or_else(|| {
                PreservationError::TypeMismatch(format!(
                    "max-size limit must be an unsigned integer, got {}",
                    action.value
                ))
            })?;
            let size = value_size(&field.value) as u64;
            if size > limit {
                Err(failed(format!("{size} bytes exceeds {limit}")))
            } else {
                Ok(())
            }
        }
        "not-null" => Ok(()),
        other => Err(PreservationError::InvalidConfiguration(format!(
            "unknown validation `{other}`"
        ))),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
