mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{converter, fast_batch, platform, reference, seeded_store, ConflictingStore};
use schemashift::optimizer::{CacheConfig, ConversionCache};
use schemashift::preservation::{
    FieldDescriptor, Policy, PolicyManager, PolicyRule, RecordingEvents, StrategyRegistry,
    DEFAULT_ANNOTATION_BASE,
};
use schemashift::{
    BatchError, BatchProcessor, BatchStatus, ConversionOptimizer, Converter, EngineConfig,
    MapperRegistry, OpContext, OptimizerConfig, PolicyEngine,
};
use serde_json::json;

#[test]
fn permanent_conflicts_stop_at_the_retry_ceiling() {
    let store = Arc::new(ConflictingStore::new(seeded_store(1), u32::MAX, &["p0"]));
    let processor = BatchProcessor::new(
        store.clone(),
        converter(),
        fast_batch(1).with_max_retries(3),
    )
    .unwrap();

    let err = processor
        .process_batch(&OpContext::background(), &[reference("p0")], "v1beta1")
        .unwrap_err();

    let BatchError::Failures { failed, total, results } = err else {
        panic!("expected failures, got {err:?}");
    };
    assert_eq!((failed, total), (1, 1));
    assert_eq!(results[0].status, BatchStatus::Failed);
    assert_eq!(results[0].retry_count, 3);
    assert!(results[0].error.as_deref().unwrap_or_default().contains("conflict"));
    assert_eq!(store.updates(), 4);
}

#[test]
fn equal_priority_rules_resolve_the_same_way_in_any_registration_order() {
    let alpha = Policy::new("alpha", 50).with_rule(PolicyRule::new("b-copy", "^Spec\\.", "deep-copy", 10));
    let beta = Policy::new("beta", 50).with_rule(PolicyRule::new("a-annotate", "^Spec\\.", "annotation", 10));

    let winners: Vec<String> = [vec![alpha.clone(), beta.clone()], vec![beta, alpha]]
        .into_iter()
        .map(|policies| {
            let registry = Arc::new(StrategyRegistry::with_defaults(DEFAULT_ANNOTATION_BASE, 1024).unwrap());
            let manager = PolicyManager::new(registry, Arc::new(RecordingEvents::new()));
            manager.register_policies(policies).unwrap();
            let mut field = FieldDescriptor::new("Spec.Retention", json!("7d"));
            let decision = manager
                .apply_policies(&platform("p"), &mut field)
                .unwrap()
                .decision
                .unwrap();
            format!("{}/{}", decision.rule, decision.strategy_name)
        })
        .collect();

    assert_eq!(winners[0], winners[1]);
    assert_eq!(winners[0], "a-annotate/annotation");
}

#[test]
fn cached_results_are_isolated_copies() {
    let cache = ConversionCache::new(CacheConfig::default().with_sweep_interval(Duration::ZERO)).unwrap();
    let mut original = platform("p");
    cache.insert("k", &original).unwrap();

    original.set_field("Spec.Replicas", json!(9)).unwrap();
    let mut first = cache.get("k").unwrap();
    assert_eq!(first.get_field("Spec.Replicas").unwrap(), Some(&json!(2)));

    first.set_field("Spec.Replicas", json!(5)).unwrap();
    let second = cache.get("k").unwrap();
    assert_eq!(second.get_field("Spec.Replicas").unwrap(), Some(&json!(2)));
}

#[test]
fn migrating_twice_skips_everything_the_second_time() {
    let store = Arc::new(seeded_store(6));
    let processor = BatchProcessor::new(store, converter(), fast_batch(3)).unwrap();
    let refs: Vec<_> = (0..6).map(|i| reference(&format!("p{i}"))).collect();
    let ctx = OpContext::background();

    let first = processor.process_batch(&ctx, &refs, "v1beta1").unwrap();
    assert!(first.iter().all(|r| r.status == BatchStatus::Success));

    let second = processor.process_batch(&ctx, &refs, "v1beta1").unwrap();
    assert_eq!(second.len(), 6);
    assert!(second.iter().all(|r| r.status == BatchStatus::Skipped));

    let metrics = processor.metrics();
    assert_eq!(metrics.total_batches, 2);
    assert_eq!(metrics.successful_conversions, 6);
    assert_eq!(metrics.skipped_resources, 6);
}

#[test]
fn shared_converter_is_safe_across_threads() {
    let engine = PolicyEngine::from_config(&EngineConfig::default(), Arc::new(RecordingEvents::new())).unwrap();
    let optimizer = ConversionOptimizer::new(
        OptimizerConfig::default().with_cache(CacheConfig::default().with_sweep_interval(Duration::ZERO)),
    )
    .unwrap();
    let converter = Arc::new(
        Converter::new(Arc::new(engine), Arc::new(MapperRegistry::with_passthrough()))
            .with_optimizer(Arc::new(optimizer)),
    );

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let converter = Arc::clone(&converter);
            thread::spawn(move || {
                for i in 0..25 {
                    // Every name is converted by two threads.
                    let name = format!("p{}", (t * 25 + i) % 100);
                    let out = converter.convert(&platform(&name), "v1beta1").unwrap();
                    assert_eq!(out.api_version(), "observability.io/v1beta1");
                    assert_eq!(out.name(), name);
                    assert_eq!(out.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = converter.engine().metrics();
    assert_eq!(metrics.restoration_failures, 0);
    let stats = converter.optimizer().unwrap().cache_stats().unwrap();
    assert_eq!(stats.hits + stats.misses, 200);
}
