//! # schemashift field preservation
//!
//! Decides, per field, how to carry information across a schema version
//! change that the destination version cannot express natively.
//!
//! ## Pieces
//!
//! - **[`StrategyRegistry`]** - named [`PreservationStrategy`] instances,
//!   validated when they are registered.
//! - **[`PolicyManager`]** - prioritized [`Policy`] rules that map field
//!   paths (regex) plus conditions to a strategy name, and run the winning
//!   rule's actions.
//! - **[`PolicyEngine`]** - one call that matches, falls back to the
//!   default strategy, applies, and counts.
//!
//! Preservation happens before field mapping; restore happens after it,
//! with the same strategy the record names in `registered_as`.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use preservation::{EngineConfig, FieldDescriptor, PolicyEngine, TracingEvents};
//! use resource::Resource;
//! use serde_json::json;
//!
//! let engine = PolicyEngine::from_config(&EngineConfig::default(), Arc::new(TracingEvents)).unwrap();
//! let mut object = Resource::new("example.io/v1alpha1", "Widget", "default", "w1")
//!     .with_status(json!({"phase": "Ready"}));
//! let mut field = FieldDescriptor::new("Status.Phase", json!("Ready"));
//!
//! let preserved = engine.preserve_field(&mut object, &mut field).unwrap();
//! object.remove_field("Status.Phase").unwrap();
//! engine.restore_field(&mut object, &preserved).unwrap();
//! assert_eq!(object.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
//! ```

mod engine;
mod error;
mod field;
pub mod policy;
mod registry;
pub mod strategy;

pub use crate::engine::{EngineConfig, EngineMetrics, PolicyEngine};
pub use crate::error::PreservationError;
pub use crate::field::{checksum, json_type_name, value_size, FieldDescriptor, PreservedField};
pub use crate::policy::{
    default_policies, CustomPredicate, Policy, PolicyAction, PolicyAlert, PolicyCondition,
    PolicyDecision, PolicyEvent, PolicyManager, PolicyOutcome, PolicyRule, PreservationEvents,
    RecordingEvents, TracingEvents,
};
pub use crate::registry::{StrategyRegistry, DEFAULT_ANNOTATION_BASE};
pub use crate::strategy::{PreservationStrategy, StrategyType};
