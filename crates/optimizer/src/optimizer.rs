use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use resource::Resource;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{cache_key, CacheConfig, CacheStats, ConversionCache};
use crate::error::OptimizeError;
use crate::strategies::{
    identity_component, inflate_compressed_fields, BatchingStrategy, ComponentConverter,
    CompressionStrategy, FieldSkippingStrategy, LazyLease, LazyLoadingStrategy,
    OptimizationStrategy, ParallelizationStrategy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub cache_enabled: bool,
    pub cache: CacheConfig,
    pub lazy_threshold_bytes: usize,
    pub compression_threshold_bytes: usize,
    pub max_parallel_conversions: usize,
    pub field_skipping: bool,
    pub lazy_loading: bool,
    pub batching: bool,
    pub compression: bool,
    pub parallelization: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache: CacheConfig::default(),
            lazy_threshold_bytes: 1024,
            compression_threshold_bytes: 512,
            max_parallel_conversions: 10,
            field_skipping: true,
            lazy_loading: true,
            batching: true,
            compression: true,
            parallelization: true,
        }
    }
}

impl OptimizerConfig {
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_lazy_threshold(mut self, bytes: usize) -> Self {
        self.lazy_threshold_bytes = bytes;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold_bytes = bytes;
        self
    }

    pub fn with_max_parallel_conversions(mut self, workers: usize) -> Self {
        self.max_parallel_conversions = workers;
        self
    }

    /// Turn every optimization step off, leaving only the cache.
    pub fn cache_only(mut self) -> Self {
        self.field_skipping = false;
        self.lazy_loading = false;
        self.batching = false;
        self.compression = false;
        self.parallelization = false;
        self
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        if self.cache_enabled && self.cache.capacity == 0 {
            return Err(OptimizeError::InvalidConfig("cache capacity must be at least 1".into()));
        }
        if self.cache_enabled && self.cache.ttl.is_zero() {
            return Err(OptimizeError::InvalidConfig("cache ttl must be positive".into()));
        }
        if self.parallelization && self.max_parallel_conversions == 0 {
            return Err(OptimizeError::InvalidConfig(
                "max_parallel_conversions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time optimizer counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_conversions: u64,
    pub cached_conversions: u64,
    pub optimized_conversions: u64,
    #[serde(with = "resource::serde_millis")]
    pub average: Duration,
    #[serde(with = "resource::serde_millis")]
    pub fastest: Duration,
    #[serde(with = "resource::serde_millis")]
    pub slowest: Duration,
    pub by_target_version: BTreeMap<String, u64>,
    pub by_optimization: BTreeMap<String, u64>,
}

impl PerformanceMetrics {
    fn record(&mut self, elapsed: Duration, target_version: &str) {
        self.total_conversions += 1;
        *self.by_target_version.entry(target_version.to_string()).or_insert(0) += 1;
        let n = self.total_conversions as f64;
        let mean = self.average.as_secs_f64();
        self.average = Duration::from_secs_f64((mean + (elapsed.as_secs_f64() - mean) / n).max(0.0));
        if self.total_conversions == 1 || elapsed < self.fastest {
            self.fastest = elapsed;
        }
        if elapsed > self.slowest {
            self.slowest = elapsed;
        }
    }
}

/// Output of [`ConversionOptimizer::optimize_conversion`].
#[derive(Debug, Clone)]
pub struct OptimizedConversion {
    pub resource: Resource,
    pub cache_hit: bool,
    /// Steps that ran and were kept, in pipeline order. Empty on a hit.
    pub applied: Vec<&'static str>,
    /// Keeps the lazy references in `resource` resolvable until dropped.
    pub lease: LazyLease,
}

/// Cache lookup plus the fixed optimization pipeline: field skipping, lazy
/// loading, batching, compression, parallelization.
pub struct ConversionOptimizer {
    config: OptimizerConfig,
    cache: Option<ConversionCache>,
    lazy: Arc<LazyLoadingStrategy>,
    steps: Vec<Arc<dyn OptimizationStrategy>>,
    metrics: Mutex<PerformanceMetrics>,
}

impl ConversionOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizeError> {
        Self::with_component_converter(config, identity_component())
    }

    /// Like [`new`](Self::new), with a custom converter for the
    /// parallelization step.
    pub fn with_component_converter(
        config: OptimizerConfig,
        converter: ComponentConverter,
    ) -> Result<Self, OptimizeError> {
        config.validate()?;
        let cache = if config.cache_enabled {
            Some(ConversionCache::new(config.cache)?)
        } else {
            None
        };

        let lazy = Arc::new(LazyLoadingStrategy::new(config.lazy_threshold_bytes));
        let mut steps: Vec<Arc<dyn OptimizationStrategy>> = Vec::new();
        if config.field_skipping {
            steps.push(Arc::new(FieldSkippingStrategy));
        }
        if config.lazy_loading {
            steps.push(lazy.clone());
        }
        if config.batching {
            steps.push(Arc::new(BatchingStrategy::new()));
        }
        if config.compression {
            steps.push(Arc::new(CompressionStrategy::new(config.compression_threshold_bytes)));
        }
        if config.parallelization {
            steps.push(Arc::new(ParallelizationStrategy::new(
                config.max_parallel_conversions,
                converter,
            )));
        }

        Ok(Self {
            config,
            cache,
            lazy,
            steps,
            metrics: Mutex::new(PerformanceMetrics::default()),
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Serve from the cache, or run the pipeline on a copy of `source` and
    /// cache the result. A failing step is logged and skipped; a failed
    /// cache write is logged and the uncached result returned.
    pub fn optimize_conversion(&self, source: &Resource, target_version: &str) -> OptimizedConversion {
        let started = Instant::now();
        let key = self.cache.as_ref().map(|_| cache_key(source, target_version));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some((hit, attachments)) = cache.get_with_attachments(key) {
                let lease = self.lazy.lease_attachments(attachments);
                let mut metrics = self.lock_metrics();
                metrics.cached_conversions += 1;
                metrics.record(started.elapsed(), target_version);
                drop(metrics);
                debug!(resource = %source.reference(), target = target_version, "conversion_cache_hit");
                return OptimizedConversion {
                    resource: hit,
                    cache_hit: true,
                    applied: Vec::new(),
                    lease,
                };
            }
        }

        let mut working = source.clone();
        let mut applied = Vec::new();
        for step in &self.steps {
            if !step.can_optimize(&working, target_version) {
                continue;
            }
            let mut candidate = working.clone();
            match step.optimize(&mut candidate, target_version) {
                Ok(()) => {
                    working = candidate;
                    applied.push(step.name());
                }
                Err(err) => warn!(
                    step = step.name(),
                    resource = %source.reference(),
                    error = %err,
                    "optimization_step_failed"
                ),
            }
        }

        // The lazy step left one hold per reference it placed in `working`.
        let lease = self.lazy.adopt(&working);
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            let attachments = self.lazy.attachments(lease.references());
            if let Err(err) = cache.insert_with_attachments(key, &working, attachments) {
                warn!(resource = %source.reference(), error = %err, "conversion_cache_write_failed");
            }
        }

        let mut metrics = self.lock_metrics();
        if !applied.is_empty() {
            metrics.optimized_conversions += 1;
        }
        for name in &applied {
            *metrics.by_optimization.entry(name.to_string()).or_insert(0) += 1;
        }
        metrics.record(started.elapsed(), target_version);
        drop(metrics);

        OptimizedConversion {
            resource: working,
            cache_hit: false,
            applied,
            lease,
        }
    }

    /// Undo the payload-shrinking steps: resolve lazy references and
    /// inflate compressed fields.
    pub fn finalize(&self, object: &mut Resource) -> Result<(), OptimizeError> {
        self.lazy.materialize(object)?;
        inflate_compressed_fields(object)?;
        Ok(())
    }

    pub fn materialize(&self, object: &mut Resource) -> Result<usize, OptimizeError> {
        self.lazy.materialize(object)
    }

    /// Lazy values currently held in the side store.
    pub fn lazy_values_held(&self) -> usize {
        self.lazy.store().len()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.lock_metrics().clone()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ConversionCache::stats)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            debug!("conversion_cache_cleared");
        }
    }

    fn lock_metrics(&self) -> MutexGuard<'_, PerformanceMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConversionOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionOptimizer")
            .field("config", &self.config)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
