//! Rate-limited worker pool that migrates many stored resources.
//!
//! Each batch gets its own [`RetryQueue`] and result channel. Workers pull
//! items until every resource has a final outcome, the batch deadline
//! passes, or the caller cancels. Items in flight when the batch is
//! aborted produce no result.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use resource::{ListFilter, OpContext, Resource, ResourceRef, ResourceStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::converter::Converter;
use crate::error::BatchError;
use crate::metrics::{BatchMetrics, MetricsRecorder};
use crate::queue::{BackoffConfig, RateLimitConfig, RetryQueue};
use crate::types::{BatchConversionResult, BatchStatus, BatchWorkItem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_workers: usize,
    /// Chunk size for [`BatchProcessor::migrate_all`].
    pub batch_size: usize,
    /// Requeues allowed per resource before it is reported `Failed`.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub requeue_rate: RateLimitConfig,
    /// Upper bound on one batch, including every retry.
    #[serde(with = "resource::serde_millis")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            batch_size: 100,
            max_retries: 3,
            backoff: BackoffConfig::default(),
            requeue_rate: RateLimitConfig::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl BatchConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_requeue_rate(mut self, rate: RateLimitConfig) -> Self {
        self.requeue_rate = rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        let invalid = |reason: &str| Err(BatchError::InvalidConfig(reason.to_string()));
        if self.max_workers == 0 {
            return invalid("max_workers must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return invalid("backoff base delay exceeds the maximum delay");
        }
        if !self.requeue_rate.requests_per_second.is_finite() {
            return invalid("requeue rate must be finite");
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be positive");
        }
        Ok(())
    }
}

/// Receives every attempt outcome, including intermediate `Retrying` ones.
pub trait BatchObserver: Send + Sync {
    fn on_result(&self, result: &BatchConversionResult);
}

/// Outcome of one attempt at one work item.
enum Attempt {
    Resolved(BatchStatus, Option<String>),
    Retryable(String),
    /// The batch context ended mid-attempt; no result is emitted.
    Abandoned,
}

pub struct BatchProcessor {
    store: Arc<dyn ResourceStore>,
    converter: Arc<Converter>,
    config: BatchConfig,
    max_workers: AtomicUsize,
    active_workers: AtomicUsize,
    live_queues: DashMap<u64, Arc<RetryQueue>>,
    next_batch: AtomicU64,
    metrics: MetricsRecorder,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("max_workers", &self.max_workers())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        converter: Arc<Converter>,
        config: BatchConfig,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            store,
            converter,
            max_workers: AtomicUsize::new(config.max_workers),
            config,
            active_workers: AtomicUsize::new(0),
            live_queues: DashMap::new(),
            next_batch: AtomicU64::new(0),
            metrics: MetricsRecorder::default(),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn converter(&self) -> &Arc<Converter> {
        &self.converter
    }

    /// Applies from the next batch on.
    pub fn set_max_workers(&self, workers: usize) {
        self.max_workers.store(workers.max(1), Ordering::SeqCst);
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> BatchMetrics {
        let mut metrics = self.metrics.snapshot();
        metrics.active_workers = self.active_workers.load(Ordering::SeqCst);
        metrics.queue_size = self.live_queues.iter().map(|q| q.value().len()).sum();
        metrics
    }

    /// Convert every resource in `resources` to `target_version`.
    ///
    /// `Ok` only when no resource ended `Failed` and the batch ran to
    /// completion; otherwise the error carries every collected result.
    pub fn process_batch(
        &self,
        ctx: &OpContext,
        resources: &[ResourceRef],
        target_version: &str,
    ) -> Result<Vec<BatchConversionResult>, BatchError> {
        let total = resources.len();
        let started = Instant::now();
        if total == 0 {
            self.metrics.record_batch(0, started.elapsed(), &[]);
            return Ok(Vec::new());
        }

        let workers = self.max_workers().min(total).max(1);
        info!(resources = total, target = target_version, workers, "batch_started");

        let batch_ctx = ctx.child_with_timeout(self.config.timeout);
        let queue = Arc::new(RetryQueue::new(self.config.backoff, self.config.requeue_rate));
        let batch_id = self.next_batch.fetch_add(1, Ordering::SeqCst);
        self.live_queues.insert(batch_id, Arc::clone(&queue));

        for reference in resources {
            queue.add(BatchWorkItem::new(reference.clone(), target_version));
        }

        let (tx, rx) = mpsc::sync_channel::<BatchConversionResult>(total);
        let results = thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let batch_ctx = &batch_ctx;
                scope.spawn(move || self.worker(batch_ctx, queue, tx));
            }
            drop(tx);

            let mut results = Vec::with_capacity(total);
            for result in rx {
                results.push(result);
                if results.len() == total {
                    queue.shut_down();
                }
            }
            results
        });
        self.live_queues.remove(&batch_id);

        let elapsed = started.elapsed();
        self.metrics.record_batch(total, elapsed, &results);
        let failed = count_failed(&results);

        if results.len() < total {
            let reason = batch_ctx
                .err()
                .unwrap_or(resource::ContextError::DeadlineExceeded);
            warn!(
                collected = results.len(),
                total,
                failed,
                reason = %reason,
                "batch_aborted"
            );
            return Err(BatchError::Aborted {
                reason,
                failed,
                collected: results.len(),
                total,
                results,
            });
        }
        if failed > 0 {
            warn!(failed, total, elapsed_ms = elapsed.as_millis() as u64, "batch_completed_with_failures");
            return Err(BatchError::Failures {
                failed,
                total,
                results,
            });
        }
        info!(resources = total, elapsed_ms = elapsed.as_millis() as u64, "batch_completed");
        Ok(results)
    }

    /// List everything matching `filter` and process it in chunks of
    /// `batch_size`.
    pub fn migrate_all(
        &self,
        ctx: &OpContext,
        filter: &ListFilter,
        target_version: &str,
    ) -> Result<Vec<BatchConversionResult>, BatchError> {
        let references: Vec<ResourceRef> = self
            .store
            .list(ctx, filter)?
            .iter()
            .map(Resource::reference)
            .collect();
        let total = references.len();
        info!(resources = total, target = target_version, "migration_started");

        let mut all = Vec::with_capacity(total);
        for chunk in references.chunks(self.config.batch_size.max(1)) {
            match self.process_batch(ctx, chunk, target_version) {
                Ok(results) | Err(BatchError::Failures { results, .. }) => all.extend(results),
                Err(BatchError::Aborted { reason, results, .. }) => {
                    all.extend(results);
                    return Err(BatchError::Aborted {
                        reason,
                        failed: count_failed(&all),
                        collected: all.len(),
                        total,
                        results: all,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let failed = count_failed(&all);
        if failed > 0 {
            return Err(BatchError::Failures {
                failed,
                total,
                results: all,
            });
        }
        Ok(all)
    }

    fn worker(&self, ctx: &OpContext, queue: &RetryQueue, results: mpsc::SyncSender<BatchConversionResult>) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        while let Some(item) = queue.get(ctx) {
            let result = match self.attempt(ctx, &item) {
                Attempt::Abandoned => {
                    debug!(resource = %item.resource, "attempt_abandoned");
                    continue;
                }
                Attempt::Retryable(error) if item.retry_count < self.config.max_retries => {
                    let retrying = BatchConversionResult::new(&item, BatchStatus::Retrying, Some(error));
                    self.notify(&retrying);
                    let delay = queue.add_rate_limited(item.next_attempt());
                    debug!(
                        resource = %item.resource,
                        retry = item.retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = retrying.error.as_deref().unwrap_or_default(),
                        "resource_requeued"
                    );
                    continue;
                }
                Attempt::Retryable(error) => {
                    BatchConversionResult::new(&item, BatchStatus::Failed, Some(error))
                }
                Attempt::Resolved(status, error) => BatchConversionResult::new(&item, status, error),
            };

            queue.forget(&item.resource);
            if result.status == BatchStatus::Failed {
                warn!(
                    resource = %result.resource,
                    retries = result.retry_count,
                    error = result.error.as_deref().unwrap_or_default(),
                    "resource_conversion_failed"
                );
            }
            self.notify(&result);
            if results.send(result).is_err() {
                break;
            }
        }
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn attempt(&self, ctx: &OpContext, item: &BatchWorkItem) -> Attempt {
        let object = match self.store.get(ctx, &item.resource) {
            Ok(object) => object,
            Err(err) => return classify_store_error("fetch", err),
        };
        if self.converter.is_at_target(&object, &item.target_version) {
            debug!(resource = %item.resource, target = %item.target_version, "already_at_target");
            return Attempt::Resolved(BatchStatus::Skipped, None);
        }
        let converted = match self.converter.convert(&object, &item.target_version) {
            Ok(converted) => converted,
            Err(err) => return Attempt::Retryable(format!("conversion failed: {err}")),
        };
        match self.store.update(ctx, &converted) {
            Ok(_) => Attempt::Resolved(BatchStatus::Success, None),
            Err(err) => classify_store_error("update", err),
        }
    }

    fn notify(&self, result: &BatchConversionResult) {
        if let Some(observer) = &self.observer {
            observer.on_result(result);
        }
    }
}

fn classify_store_error(stage: &str, err: StoreError) -> Attempt {
    if matches!(err, StoreError::Context(_)) {
        return Attempt::Abandoned;
    }
    let message = format!("{stage} failed: {err}");
    if err.is_not_found() {
        Attempt::Resolved(BatchStatus::Skipped, Some(message))
    } else if err.is_retryable() {
        Attempt::Retryable(message)
    } else {
        Attempt::Resolved(BatchStatus::Failed, Some(message))
    }
}

fn count_failed(results: &[BatchConversionResult]) -> usize {
    results
        .iter()
        .filter(|r| r.status == BatchStatus::Failed)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use preservation::{EngineConfig, PolicyEngine, RecordingEvents};
    use resource::{FnMapper, InMemoryStore, MapperError, MapperRegistry};
    use serde_json::json;
    use std::sync::Mutex;

    /// Store wrapper that fails the first `conflicts` updates of every
    /// resource whose name is listed.
    struct FlakyStore {
        inner: InMemoryStore,
        conflicts: u32,
        flaky: Vec<String>,
        seen: Mutex<std::collections::HashMap<String, u32>>,
    }

    impl ResourceStore for FlakyStore {
        fn get(&self, ctx: &OpContext, reference: &ResourceRef) -> Result<Resource, StoreError> {
            self.inner.get(ctx, reference)
        }

        fn update(&self, ctx: &OpContext, resource: &Resource) -> Result<Resource, StoreError> {
            if self.flaky.iter().any(|n| n == resource.name()) {
                let mut seen = self.seen.lock().unwrap();
                let count = seen.entry(resource.name().to_string()).or_insert(0);
                if *count < self.conflicts {
                    *count += 1;
                    return Err(StoreError::Conflict {
                        reference: resource.reference(),
                        expected: resource.resource_version().to_string(),
                        actual: "newer".into(),
                    });
                }
            }
            self.inner.update(ctx, resource)
        }

        fn list(&self, ctx: &OpContext, filter: &ListFilter) -> Result<Vec<Resource>, StoreError> {
            self.inner.list(ctx, filter)
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<BatchConversionResult>>);

    impl BatchObserver for Collect {
        fn on_result(&self, result: &BatchConversionResult) {
            self.0.lock().unwrap().push(result.clone());
        }
    }

    fn converter() -> Arc<Converter> {
        let engine =
            PolicyEngine::from_config(&EngineConfig::default(), Arc::new(RecordingEvents::new())).unwrap();
        Arc::new(Converter::new(
            Arc::new(engine),
            Arc::new(MapperRegistry::with_passthrough()),
        ))
    }

    fn seeded(names: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::new();
        for name in names {
            store.insert(
                Resource::new("example.io/v1alpha1", "Widget", "default", *name)
                    .with_spec(json!({"replicas": 1})),
            )
            .unwrap();
        }
        store
    }

    fn fast_config() -> BatchConfig {
        BatchConfig::default()
            .with_max_workers(2)
            .with_backoff(BackoffConfig::default().with_base_delay(Duration::from_millis(1)))
            .with_timeout(Duration::from_secs(10))
    }

    fn widget(name: &str) -> ResourceRef {
        ResourceRef::new("Widget", "default", name)
    }

    #[test]
    fn converts_and_skips_missing() {
        let store = Arc::new(seeded(&["a", "b", "c"]));
        let processor = BatchProcessor::new(store.clone(), converter(), fast_config()).unwrap();
        let refs = [widget("a"), widget("b"), widget("ghost"), widget("c")];

        let results = processor
            .process_batch(&OpContext::background(), &refs, "v1beta1")
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);
        assert_eq!(
            results.iter().find(|r| r.resource.name == "ghost").unwrap().status,
            BatchStatus::Skipped
        );

        let stored = store.get(&OpContext::background(), &widget("a")).unwrap();
        assert_eq!(stored.api_version(), "example.io/v1beta1");

        let metrics = processor.metrics();
        assert_eq!(metrics.total_batches, 1);
        assert_eq!(metrics.successful_conversions, 3);
        assert_eq!(metrics.skipped_resources, 1);
        assert_eq!(metrics.queue_size, 0);
        assert_eq!(metrics.active_workers, 0);
    }

    #[test]
    fn conflicts_are_retried_up_to_the_ceiling() {
        let store = Arc::new(FlakyStore {
            inner: seeded(&["ok", "stuck"]),
            conflicts: u32::MAX,
            flaky: vec!["stuck".into()],
            seen: Mutex::default(),
        });
        let observer = Arc::new(Collect::default());
        let processor = BatchProcessor::new(store, converter(), fast_config())
            .unwrap()
            .with_observer(observer.clone());

        let err = processor
            .process_batch(&OpContext::background(), &[widget("ok"), widget("stuck")], "v1beta1")
            .unwrap_err();
        assert_eq!(err.failed(), 1);
        let stuck = err.results().iter().find(|r| r.resource.name == "stuck").unwrap();
        assert_eq!(stuck.status, BatchStatus::Failed);
        assert_eq!(stuck.retry_count, 3);

        let retrying = observer
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == BatchStatus::Retrying)
            .count();
        assert_eq!(retrying, 3);
    }

    #[test]
    fn converted_resources_are_skipped_next_time() {
        let store = Arc::new(seeded(&["a"]));
        let processor = BatchProcessor::new(store, converter(), fast_config()).unwrap();
        let ctx = OpContext::background();
        processor.process_batch(&ctx, &[widget("a")], "v1beta1").unwrap();
        let again = processor.process_batch(&ctx, &[widget("a")], "v1beta1").unwrap();
        assert_eq!(again[0].status, BatchStatus::Skipped);
        assert!(again[0].error.is_none());
    }

    #[test]
    fn migrate_all_chunks_the_listing() {
        let names: Vec<String> = (0..7).map(|i| format!("w{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let store = Arc::new(seeded(&refs));
        let processor =
            BatchProcessor::new(store, converter(), fast_config().with_batch_size(3)).unwrap();

        let results = processor
            .migrate_all(&OpContext::background(), &ListFilter::new().with_kind("Widget"), "v1beta1")
            .unwrap();
        assert_eq!(results.len(), 7);
        let metrics = processor.metrics();
        assert_eq!(metrics.total_batches, 3);
        assert_eq!(metrics.largest_batch, 3);
    }

    #[test]
    fn cancelled_batch_returns_partial_results() {
        let store = Arc::new(FlakyStore {
            inner: seeded(&["stuck"]),
            conflicts: u32::MAX,
            flaky: vec!["stuck".into()],
            seen: Mutex::default(),
        });
        let config = fast_config()
            .with_max_retries(100)
            .with_backoff(BackoffConfig::default().with_base_delay(Duration::from_millis(20)));
        let processor = BatchProcessor::new(store, converter(), config).unwrap();

        let ctx = OpContext::background();
        let canceller = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                ctx.cancel();
            })
        };
        let err = processor
            .process_batch(&ctx, &[widget("stuck")], "v1beta1")
            .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(
            err,
            BatchError::Aborted { reason: resource::ContextError::Cancelled, collected: 0, .. }
        ));
    }

    #[test]
    fn conversion_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mappers = MapperRegistry::new();
        let counter = Arc::clone(&calls);
        mappers
            .register(
                "v1alpha1",
                "v1beta1",
                Arc::new(FnMapper::new(
                    move |_: &mut Resource| -> Result<(), MapperError> {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            return Err(MapperError::Mapping("schema registry unavailable".into()));
                        }
                        Ok(())
                    },
                    |_: &mut Resource| -> Result<(), MapperError> { Ok(()) },
                )),
            )
            .unwrap();
        let engine =
            PolicyEngine::from_config(&EngineConfig::default(), Arc::new(RecordingEvents::new())).unwrap();
        let converter = Arc::new(Converter::new(Arc::new(engine), Arc::new(mappers)));
        let observer = Arc::new(Collect::default());
        let processor = BatchProcessor::new(Arc::new(seeded(&["a"])), converter, fast_config())
            .unwrap()
            .with_observer(observer.clone());

        let results = processor
            .process_batch(&OpContext::background(), &[widget("a")], "v1beta1")
            .unwrap();
        assert_eq!(results[0].status, BatchStatus::Success);
        assert_eq!(results[0].retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let seen = observer.0.lock().unwrap();
        let retrying = seen.iter().find(|r| r.status == BatchStatus::Retrying).unwrap();
        assert!(retrying.error.as_deref().unwrap().contains("schema registry unavailable"));
    }

    #[test]
    fn batch_deadline_aborts_with_partial_results() {
        let store = Arc::new(FlakyStore {
            inner: seeded(&["ok", "stuck"]),
            conflicts: u32::MAX,
            flaky: vec!["stuck".into()],
            seen: Mutex::default(),
        });
        let config = fast_config()
            .with_max_retries(1000)
            .with_backoff(BackoffConfig::default().with_base_delay(Duration::from_millis(20)))
            .with_timeout(Duration::from_millis(50));
        let processor = BatchProcessor::new(store, converter(), config).unwrap();

        let err = processor
            .process_batch(&OpContext::background(), &[widget("ok"), widget("stuck")], "v1beta1")
            .unwrap_err();

        let BatchError::Aborted { reason, failed, collected, total, results } = err else {
            panic!("expected an aborted batch, got {err:?}");
        };
        assert_eq!(reason, resource::ContextError::DeadlineExceeded);
        assert_eq!((failed, collected, total), (0, 1, 2));
        assert_eq!(results[0].resource.name, "ok");
        assert_eq!(results[0].status, BatchStatus::Success);
        assert_eq!(processor.metrics().active_workers, 0);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = BatchProcessor::new(
            Arc::new(InMemoryStore::new()),
            converter(),
            BatchConfig::default().with_max_workers(0),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
    }
}
