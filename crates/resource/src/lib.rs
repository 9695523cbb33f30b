//! # schemashift resource model
//!
//! Shared vocabulary for the migration stages: the unstructured
//! [`Resource`], dotted field paths, the [`ResourceStore`] and
//! [`FieldMapper`] collaborator interfaces, and the [`OpContext`] that
//! carries deadlines and cancellation into blocking calls.
//!
//! ```
//! use resource::{InMemoryStore, OpContext, Resource, ResourceStore};
//! use serde_json::json;
//!
//! let store = InMemoryStore::new();
//! let widget = Resource::new("example.io/v1alpha1", "Widget", "default", "w1")
//!     .with_status(json!({"phase": "Ready"}));
//! let stored = store.insert(widget).unwrap();
//!
//! let fetched = store.get(&OpContext::background(), &stored.reference()).unwrap();
//! assert_eq!(fetched.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
//! ```

mod context;
mod error;
mod mapper;
mod object;
pub mod path;
pub mod serde_millis;
mod store;

pub use crate::context::{ContextError, OpContext};
pub use crate::error::{FieldPathError, MapperError, StoreError};
pub use crate::mapper::{FieldMapper, FnMapper, MapperRegistry, PassthroughMapper};
pub use crate::object::{Resource, ResourceRef};
pub use crate::path::FieldPath;
pub use crate::store::{InMemoryStore, ListFilter, ResourceStore};
