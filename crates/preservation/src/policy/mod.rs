//! Declarative policies: which strategy applies to which fields, under
//! which conditions, with which side-effecting actions.
//!
//! Policies are plain serde data so they can live in YAML. Condition,
//! operator and action kinds are kept as strings here and parsed when the
//! policy is registered, so an unknown kind is reported as an invalid
//! policy rather than a deserialization failure.

mod action;
mod condition;
mod defaults;
mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use action::{PolicyAlert, PolicyEvent, PreservationEvents, RecordingEvents, TracingEvents};
pub use condition::CustomPredicate;
pub use defaults::default_policies;
pub use manager::{PolicyDecision, PolicyManager, PolicyOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority,
            enabled: true,
            rules: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    /// Regex matched (not prefix-matched) against the field path.
    pub field_pattern: String,
    /// Strategy registry name.
    pub strategy: String,
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
    #[serde(default)]
    pub actions: Vec<PolicyAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl PolicyRule {
    pub fn new(
        name: impl Into<String>,
        field_pattern: impl Into<String>,
        strategy: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            field_pattern: field_pattern.into(),
            strategy: strategy.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            priority,
            enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: PolicyCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: PolicyAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Pure predicate over `(object, field)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCondition {
    #[serde(rename = "type")]
    pub kind: String,
    /// Field path, annotation/label key, or custom predicate name,
    /// depending on `kind`.
    #[serde(default)]
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl PolicyCondition {
    pub fn new(
        kind: impl Into<String>,
        field: impl Into<String>,
        operator: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

/// Side effect run when its rule wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PolicyAction {
    pub fn new(kind: impl Into<String>, target: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            value,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn enabled() -> bool {
    true
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} `{other}`", stringify!($name))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }
    };
}

string_enum!(
    /// What a [`PolicyCondition`] inspects.
    ConditionType {
        Field => "field",
        Version => "version",
        Annotation => "annotation",
        Label => "label",
        Size => "size",
        Age => "age",
        Namespace => "namespace",
        ResourceType => "resource-type",
        FieldExists => "field-exists",
        FieldType => "field-type",
        Custom => "custom",
    }
);

string_enum!(
    Operator {
        Equals => "equals",
        NotEquals => "not-equals",
        Contains => "contains",
        NotContains => "not-contains",
        StartsWith => "starts-with",
        EndsWith => "ends-with",
        Matches => "matches",
        GreaterThan => "greater-than",
        LessThan => "less-than",
        GreaterThanOrEqual => "greater-than-or-equal",
        LessThanOrEqual => "less-than-or-equal",
        In => "in",
        NotIn => "not-in",
        Exists => "exists",
        NotExists => "not-exists",
    }
);

string_enum!(
    ActionType {
        Log => "log",
        Metric => "metric",
        Alert => "alert",
        Annotate => "annotate",
        Validate => "validate",
    }
);

impl Operator {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Operator::GreaterThan
                | Operator::LessThan
                | Operator::GreaterThanOrEqual
                | Operator::LessThanOrEqual
        )
    }

    pub fn is_existence(self) -> bool {
        matches!(self, Operator::Exists | Operator::NotExists)
    }
}
