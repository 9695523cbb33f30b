//! # schemashift batch migration
//!
//! [`Converter`] turns one object into its target version and is what an
//! admission webhook calls directly. [`BatchProcessor`] drives the same
//! converter over many stored resources with a bounded worker pool and a
//! rate-limited retry queue.
//!
//! Per work item:
//!
//! ```text
//! Pending ─┬─> Success
//!          ├─> Skipped                  (missing, or already at target)
//!          ├─> Failed                   (permanent store error)
//!          └─> Retrying ─> Pending      (conversion error, conflict or transient, below the ceiling)
//!                      └─> Failed       (ceiling reached)
//! ```
//!
//! ```
//! use std::sync::Arc;
//! use batch::{BatchConfig, BatchProcessor, Converter};
//! use preservation::{EngineConfig, PolicyEngine, TracingEvents};
//! use resource::{InMemoryStore, MapperRegistry, OpContext, Resource, ResourceRef};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.insert(Resource::new("example.io/v1alpha1", "Widget", "default", "w")).unwrap();
//!
//! let engine = PolicyEngine::from_config(&EngineConfig::default(), Arc::new(TracingEvents)).unwrap();
//! let converter = Converter::new(Arc::new(engine), Arc::new(MapperRegistry::with_passthrough()));
//! let processor = BatchProcessor::new(store, Arc::new(converter), BatchConfig::default()).unwrap();
//!
//! let results = processor
//!     .process_batch(&OpContext::background(), &[ResourceRef::new("Widget", "default", "w")], "v1beta1")
//!     .unwrap();
//! assert!(results[0].is_success());
//! ```

mod converter;
mod error;
mod metrics;
mod processor;
pub mod queue;
mod types;

pub use crate::converter::{ConversionReport, Converter, ConverterConfig};
pub use crate::error::{BatchError, ConversionError};
pub use crate::metrics::BatchMetrics;
pub use crate::processor::{BatchConfig, BatchObserver, BatchProcessor};
pub use crate::queue::{BackoffConfig, RateLimitConfig, RetryQueue};
pub use crate::types::{BatchConversionResult, BatchStatus, BatchWorkItem};
