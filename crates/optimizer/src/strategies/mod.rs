//! Pre-conversion optimization steps.
//!
//! Each step is gated by [`OptimizationStrategy::can_optimize`] and runs on
//! a working copy; the pipeline only keeps the copy when the step succeeds.

mod batching;
mod compression;
mod field_skipping;
mod lazy;
mod parallel;

use resource::Resource;

use crate::error::OptimizeError;

pub use batching::BatchingStrategy;
pub use compression::{inflate_compressed_fields, CompressionStrategy, COMPRESSION_ENCODING};
pub use field_skipping::FieldSkippingStrategy;
pub use lazy::{LazyEntry, LazyLease, LazyLoadingStrategy, LazyStore};
pub use parallel::{identity_component, ComponentConverter, ParallelizationStrategy};

/// Annotation prefix for optimizer markers.
pub const ANNOTATION_PREFIX: &str = "conversion.schemashift.io";

pub trait OptimizationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_optimize(&self, object: &Resource, target_version: &str) -> bool;

    fn optimize(&self, object: &mut Resource, target_version: &str) -> Result<(), OptimizeError>;
}

pub(crate) fn marker(name: &str) -> String {
    format!("{ANNOTATION_PREFIX}/{name}")
}
