//! # schemashift conversion optimizer
//!
//! Avoids redundant conversion work and shrinks large payloads before a
//! converted object crosses the wire.
//!
//! [`ConversionOptimizer::optimize_conversion`] first looks the source up in
//! the [`ConversionCache`] (keyed by [`cache_key`]). On a miss it runs the
//! fixed pipeline on a working copy and caches the result:
//!
//! 1. field skipping: drop server-managed metadata and an empty status
//! 2. lazy loading: swap large config blobs for `$ref` stubs
//! 3. batching: mark objects that share a `kind:target` group
//! 4. compression: gzip + base64 large text fields
//! 5. parallelization: convert `spec.components` entries concurrently
//!
//! [`ConversionOptimizer::finalize`] reverses steps 2 and 4 on the final
//! converted object.
//!
//! ```
//! use optimizer::{CacheConfig, ConversionOptimizer, OptimizerConfig};
//! use resource::Resource;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let config = OptimizerConfig::default()
//!     .with_cache(CacheConfig::default().with_sweep_interval(Duration::ZERO));
//! let optimizer = ConversionOptimizer::new(config).unwrap();
//! let source = Resource::new("example.io/v1alpha1", "Widget", "default", "w")
//!     .with_spec(json!({"replicas": 1}));
//!
//! assert!(!optimizer.optimize_conversion(&source, "v1beta1").cache_hit);
//! assert!(optimizer.optimize_conversion(&source, "v1beta1").cache_hit);
//! ```

mod cache;
mod error;
mod optimizer;
pub mod strategies;

pub use crate::cache::{cache_key, CacheConfig, CacheEntry, CacheStats, ConversionCache};
pub use crate::error::{CacheError, OptimizeError};
pub use crate::optimizer::{
    ConversionOptimizer, OptimizedConversion, OptimizerConfig, PerformanceMetrics,
};
pub use crate::strategies::{ComponentConverter, OptimizationStrategy};
