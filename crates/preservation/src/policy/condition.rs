use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use resource::Resource;
use serde_json::Value;

use super::{ConditionType, Operator, PolicyCondition};
use crate::error::PreservationError;
use crate::field::FieldDescriptor;

pub type CustomPredicate = Arc<dyn Fn(&Resource, &FieldDescriptor) -> bool + Send + Sync>;

/// A condition after registration-time parsing.
#[derive(Clone)]
pub(crate) struct CompiledCondition {
    pub(crate) kind: ConditionType,
    pub(crate) field: String,
    pub(crate) operator: Operator,
    pub(crate) value: Value,
    pub(crate) regex: Option<Regex>,
    pub(crate) custom: Option<CustomPredicate>,
}

impl std::fmt::Debug for CompiledCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCondition")
            .field("kind", &self.kind)
            .field("field", &self.field)
            .field("operator", &self.operator)
            .field("value", &self.value)
            .field("regex", &self.regex)
            .field("custom", &self.custom.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl CompiledCondition {
    pub(crate) fn compile(
        policy: &str,
        condition: &PolicyCondition,
        lookup_custom: impl Fn(&str) -> Option<CustomPredicate>,
    ) -> Result<Self, PreservationError> {
        let invalid = |reason: String| PreservationError::invalid_policy(policy, reason);
        let kind: ConditionType = condition.kind.parse().map_err(invalid)?;
        let operator: Operator = condition.operator.parse().map_err(invalid)?;

        let needs_field = matches!(
            kind,
            ConditionType::Annotation
                | ConditionType::Label
                | ConditionType::FieldExists
                | ConditionType::Custom
        );
        if needs_field && condition.field.trim().is_empty() {
            return Err(invalid(format!("`{kind}` condition requires a field")));
        }
        if kind == ConditionType::FieldExists && !operator.is_existence() {
            return Err(invalid(format!(
                "`field-exists` only supports exists/not-exists, not `{operator}`"
            )));
        }
        if operator.is_numeric() && as_number(&condition.value).is_none() {
            return Err(invalid(format!(
                "`{operator}` needs a numeric value, got {}",
                condition.value
            )));
        }
        if matches!(operator, Operator::In | Operator::NotIn) && !condition.value.is_array() {
            return Err(invalid(format!("`{operator}` needs a list value")));
        }

        let regex = match operator {
            Operator::Matches => {
                let pattern = condition
                    .value
                    .as_str()
                    .ok_or_else(|| invalid("`matches` needs a string pattern".into()))?;
                Some(Regex::new(pattern).map_err(|e| invalid(format!("bad pattern `{pattern}`: {e}")))?)
            }
            _ => None,
        };

        let custom = match kind {
            ConditionType::Custom => Some(lookup_custom(&condition.field).ok_or_else(|| {
                invalid(format!("custom condition `{}` is not registered", condition.field))
            })?),
            _ => None,
        };

        Ok(Self {
            kind,
            field: condition.field.clone(),
            operator,
            value: condition.value.clone(),
            regex,
            custom,
        })
    }

    /// Evaluate against `(object, field)`. Never mutates either.
    pub(crate) fn evaluate(
        &self,
        object: &Resource,
        field: &FieldDescriptor,
    ) -> Result<bool, PreservationError> {
        let actual: Option<Value> = match self.kind {
            ConditionType::Field => {
                if self.field.is_empty() {
                    Some(field.value.clone())
                } else {
                    object.get_field(&self.field)?.cloned()
                }
            }
            ConditionType::Version => Some(Value::String(object.version().to_string())),
            ConditionType::Annotation => object
                .annotation(&self.field)
                .map(|v| Value::String(v.to_string())),
            ConditionType::Label => object.label(&self.field).map(|v| Value::String(v.to_string())),
            ConditionType::Size => Some(Value::from(field.size_bytes())),
            ConditionType::Age => {
                let created = object.creation_timestamp().ok_or_else(|| {
                    PreservationError::TypeMismatch("object has no creationTimestamp".into())
                })?;
                Some(Value::from((Utc::now() - created).num_seconds()))
            }
            ConditionType::Namespace => Some(Value::String(object.namespace().to_string())),
            ConditionType::ResourceType => Some(Value::String(object.kind().to_string())),
            ConditionType::FieldExists => object.get_field(&self.field)?.cloned(),
            ConditionType::FieldType => Some(Value::String(field.type_name().to_string())),
            ConditionType::Custom => {
                let predicate = self.custom.as_ref().ok_or_else(|| {
                    PreservationError::not_found("custom condition", self.field.as_str())
                })?;
                let held = predicate(object, field);
                return Ok(match self.operator {
                    Operator::NotEquals | Operator::NotExists => !held,
                    _ => held,
                });
            }
        };
        compare(self.operator, actual.as_ref(), &self.value, self.regex.as_ref())
    }
}

/// Operators split into string and numeric paths; numeric operators never
/// coerce non-numeric input.
fn compare(
    operator: Operator,
    actual: Option<&Value>,
    expected: &Value,
    regex: Option<&Regex>,
) -> Result<bool, PreservationError> {
    let present = actual.filter(|v| !v.is_null());
    match operator {
        Operator::Exists => return Ok(present.is_some()),
        Operator::NotExists => return Ok(present.is_none()),
        _ => {}
    }

    if operator.is_numeric() {
        let actual = present.ok_or_else(|| {
            PreservationError::TypeMismatch(format!("`{operator}` applied to a missing value"))
        })?;
        let lhs = as_number(actual).ok_or_else(|| {
            PreservationError::TypeMismatch(format!("`{operator}` applied to non-numeric {actual}"))
        })?;
        let rhs = as_number(expected).ok_or_else(|| {
            PreservationError::TypeMismatch(format!("`{operator}` compared against non-numeric {expected}"))
        })?;
        return Ok(match operator {
            Operator::GreaterThan => lhs > rhs,
            Operator::LessThan => lhs < rhs,
            Operator::GreaterThanOrEqual => lhs >= rhs,
            _ => lhs <= rhs,
        });
    }

    let Some(actual) = present else {
        return Ok(matches!(
            operator,
            Operator::NotEquals | Operator::NotContains | Operator::NotIn
        ));
    };

    Ok(match operator {
        Operator::Equals => loosely_equal(actual, expected),
        Operator::NotEquals => !loosely_equal(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::StartsWith => text(actual).starts_with(&text(expected)),
        Operator::EndsWith => text(actual).ends_with(&text(expected)),
        Operator::Matches => match regex {
            Some(regex) => regex.is_match(&text(actual)),
            None => false,
        },
        Operator::In => in_list(actual, expected),
        Operator::NotIn => !in_list(actual, expected),
        _ => false,
    })
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numbers, or strings that parse as numbers in full.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    actual == expected || (!actual.is_object() && !actual.is_array() && text(actual) == text(expected))
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        Value::Object(map) => {
            let needle = text(expected);
            map.keys().any(|key| key.contains(&needle))
        }
        other => text(other).contains(&text(expected)),
    }
}

fn in_list(actual: &Value, expected: &Value) -> bool {
    expected
        .as_array()
        .is_some_and(|items| items.iter().any(|item| loosely_equal(actual, item)))
}
