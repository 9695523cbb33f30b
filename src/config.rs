//! YAML configuration for a migration run.
//!
//! One file configures every stage: preservation policies, the conversion
//! cache and optimizer, per-object conversion, and the batch worker pool.
//! Every section and every key is optional.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "observability v1alpha1 -> v1beta1"
//!
//! policy:
//!   default_strategy: "deep-copy"
//!   annotation_base: "migrate.schemashift.io/preserved"
//!   field_size_threshold: 1024
//!   use_default_policies: true
//!   policies:
//!     - name: "keep-retention"
//!       priority: 95
//!       rules:
//!         - name: "retention"
//!           field_pattern: "^Spec\\.Retention$"
//!           strategy: "annotation"
//!           priority: 95
//!
//! batch:
//!   max_workers: 5
//!   batch_size: 100
//!   max_retries: 3
//!   backoff_base_ms: 1000
//!   backoff_max_ms: 30000
//!   jitter: false
//!   requeue_rate_per_second: 10.0
//!   requeue_burst: 100
//!   timeout_secs: 300
//!
//! optimizer:
//!   cache_enabled: true
//!   cache_size: 1000
//!   cache_ttl_secs: 300
//!   sweep_interval_secs: 60
//!   lazy_threshold_bytes: 1024
//!   compression_threshold_bytes: 512
//!   max_parallel_conversions: 10
//!
//! conversion:
//!   descriptor_roots: ["Spec", "Status"]
//!   preserve_unmatched: false
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use batch::{BackoffConfig, BatchConfig, ConverterConfig, RateLimitConfig};
use optimizer::{CacheConfig, OptimizerConfig};
use preservation::{EngineConfig, Policy, DEFAULT_ANNOTATION_BASE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigLoadError> {
    Err(ConfigLoadError::Validation(message.into()))
}

/// Top-level migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MigrateConfig {
    /// Configuration format version
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub policy: PolicyYamlConfig,

    #[serde(default)]
    pub batch: BatchYamlConfig,

    #[serde(default)]
    pub optimizer: OptimizerYamlConfig,

    #[serde(default)]
    pub conversion: ConversionYamlConfig,
}

impl MigrateConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: MigrateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.policy.validate()?;
        self.batch.validate()?;
        self.optimizer.validate()?;
        self.conversion.validate()?;
        Ok(())
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            policy: PolicyYamlConfig::default(),
            batch: BatchYamlConfig::default(),
            optimizer: OptimizerYamlConfig::default(),
            conversion: ConversionYamlConfig::default(),
        }
    }
}

/// Preservation engine section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyYamlConfig {
    #[serde(default = "default_strategy")]
    pub default_strategy: String,

    #[serde(default = "default_annotation_base")]
    pub annotation_base: String,

    /// Bytes above which size-routed strategies switch to annotations.
    #[serde(default = "default_field_size_threshold")]
    pub field_size_threshold: usize,

    #[serde(default = "true_value")]
    pub use_default_policies: bool,

    /// Registered after the built-in policies, in file order.
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl PolicyYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.default_strategy.trim().is_empty() {
            return invalid("policy.default_strategy must not be empty");
        }
        if self.annotation_base.trim().is_empty() || self.annotation_base.ends_with('/') {
            return invalid("policy.annotation_base must be a non-empty prefix without a trailing '/'");
        }
        if self.field_size_threshold == 0 {
            return invalid("policy.field_size_threshold must be >= 1");
        }
        for policy in &self.policies {
            if policy.name.trim().is_empty() {
                return invalid("policy.policies entries need a name");
            }
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_default_strategy(self.default_strategy.clone())
            .with_annotation_base(self.annotation_base.clone())
            .with_field_size_threshold(self.field_size_threshold)
            .with_default_policies(self.use_default_policies)
    }
}

impl Default for PolicyYamlConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            annotation_base: default_annotation_base(),
            field_size_threshold: default_field_size_threshold(),
            use_default_policies: true,
            policies: Vec::new(),
        }
    }
}

/// Batch worker pool section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchYamlConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default)]
    pub jitter: bool,

    #[serde(default = "default_requeue_rate")]
    pub requeue_rate_per_second: f64,

    #[serde(default = "default_requeue_burst")]
    pub requeue_burst: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BatchYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.max_workers == 0 {
            return invalid("batch.max_workers must be >= 1");
        }
        if self.batch_size == 0 {
            return invalid("batch.batch_size must be >= 1");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return invalid("batch.backoff_base_ms must not exceed batch.backoff_max_ms");
        }
        if !self.requeue_rate_per_second.is_finite() || self.requeue_rate_per_second < 0.0 {
            return invalid("batch.requeue_rate_per_second must be a non-negative number");
        }
        if self.timeout_secs == 0 {
            return invalid("batch.timeout_secs must be >= 1");
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::default()
            .with_max_workers(self.max_workers)
            .with_batch_size(self.batch_size)
            .with_max_retries(self.max_retries)
            .with_backoff(
                BackoffConfig::default()
                    .with_base_delay(Duration::from_millis(self.backoff_base_ms))
                    .with_max_delay(Duration::from_millis(self.backoff_max_ms))
                    .with_jitter(self.jitter),
            )
            .with_requeue_rate(
                RateLimitConfig::default()
                    .with_requests_per_second(self.requeue_rate_per_second)
                    .with_burst_size(self.requeue_burst),
            )
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

impl Default for BatchYamlConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: false,
            requeue_rate_per_second: default_requeue_rate(),
            requeue_burst: default_requeue_burst(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Conversion cache and optimization pipeline section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerYamlConfig {
    #[serde(default = "true_value")]
    pub cache_enabled: bool,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// 0 disables the background sweep; expired entries are then only
    /// dropped on lookup.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,

    #[serde(default = "default_lazy_threshold")]
    pub lazy_threshold_bytes: usize,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    #[serde(default = "default_max_parallel")]
    pub max_parallel_conversions: usize,

    #[serde(default = "true_value")]
    pub field_skipping: bool,

    #[serde(default = "true_value")]
    pub lazy_loading: bool,

    #[serde(default = "true_value")]
    pub batching: bool,

    #[serde(default = "true_value")]
    pub compression: bool,

    #[serde(default = "true_value")]
    pub parallelization: bool,
}

impl OptimizerYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.cache_enabled && self.cache_size == 0 {
            return invalid("optimizer.cache_size must be >= 1 when the cache is enabled");
        }
        if self.cache_enabled && self.cache_ttl_secs == 0 {
            return invalid("optimizer.cache_ttl_secs must be >= 1 when the cache is enabled");
        }
        if self.max_parallel_conversions == 0 {
            return invalid("optimizer.max_parallel_conversions must be >= 1");
        }
        Ok(())
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        let cache = CacheConfig::default()
            .with_capacity(self.cache_size)
            .with_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
            .with_max_entry_bytes(self.max_entry_bytes);
        let mut config = OptimizerConfig::default()
            .with_cache_enabled(self.cache_enabled)
            .with_cache(cache)
            .with_lazy_threshold(self.lazy_threshold_bytes)
            .with_compression_threshold(self.compression_threshold_bytes)
            .with_max_parallel_conversions(self.max_parallel_conversions);
        config.field_skipping = self.field_skipping;
        config.lazy_loading = self.lazy_loading;
        config.batching = self.batching;
        config.compression = self.compression;
        config.parallelization = self.parallelization;
        config
    }
}

impl Default for OptimizerYamlConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_size: default_cache_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entry_bytes: default_max_entry_bytes(),
            lazy_threshold_bytes: default_lazy_threshold(),
            compression_threshold_bytes: default_compression_threshold(),
            max_parallel_conversions: default_max_parallel(),
            field_skipping: true,
            lazy_loading: true,
            batching: true,
            compression: true,
            parallelization: true,
        }
    }
}

/// Per-object conversion section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionYamlConfig {
    #[serde(default = "default_descriptor_roots")]
    pub descriptor_roots: Vec<String>,

    #[serde(default)]
    pub preserve_unmatched: bool,
}

impl ConversionYamlConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.descriptor_roots.iter().any(|root| root.trim().is_empty()) {
            return invalid("conversion.descriptor_roots entries must not be empty");
        }
        Ok(())
    }

    pub fn converter_config(&self) -> ConverterConfig {
        ConverterConfig::default()
            .with_descriptor_roots(self.descriptor_roots.clone())
            .with_preserve_unmatched(self.preserve_unmatched)
    }
}

impl Default for ConversionYamlConfig {
    fn default() -> Self {
        Self {
            descriptor_roots: default_descriptor_roots(),
            preserve_unmatched: false,
        }
    }
}

fn true_value() -> bool {
    true
}
fn default_strategy() -> String {
    "deep-copy".to_string()
}
fn default_annotation_base() -> String {
    DEFAULT_ANNOTATION_BASE.to_string()
}
fn default_field_size_threshold() -> usize {
    1024
}
fn default_max_workers() -> usize {
    5
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_requeue_rate() -> f64 {
    10.0
}
fn default_requeue_burst() -> u64 {
    100
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_cache_size() -> usize {
    1000
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_entry_bytes() -> usize {
    1024 * 1024
}
fn default_lazy_threshold() -> usize {
    1024
}
fn default_compression_threshold() -> usize {
    512
}
fn default_max_parallel() -> usize {
    10
}
fn default_descriptor_roots() -> Vec<String> {
    vec!["Spec".to_string(), "Status".to_string()]
}
