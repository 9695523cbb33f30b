//! Demo: migrate a handful of in-memory resources from v1alpha1 to v1beta1.
//!
//! ```text
//! schemashift [config.yaml]
//! ```
//!
//! `RUST_LOG` controls verbosity; `SCHEMASHIFT_LOG_FORMAT=json` switches
//! to JSON log lines.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use schemashift::resource::{FnMapper, MapperError};
use schemashift::{
    InMemoryStore, ListFilter, MapperRegistry, MigrateConfig, Migrator, OpContext, Resource,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true);
    if env::var("SCHEMASHIFT_LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// v1alpha1 `retention` is called `retentionPeriod` in v1beta1.
fn demo_mappers() -> Result<MapperRegistry> {
    let mappers = MapperRegistry::new();
    mappers.register(
        "v1alpha1",
        "v1beta1",
        Arc::new(FnMapper::new(
            |object: &mut Resource| -> Result<(), MapperError> {
                if let Some(retention) = object.remove_field("spec.retention")? {
                    object.set_field("spec.retentionPeriod", retention)?;
                }
                Ok(())
            },
            |object: &mut Resource| -> Result<(), MapperError> {
                if let Some(period) = object.remove_field("spec.retentionPeriod")? {
                    object.set_field("spec.retention", period)?;
                }
                Ok(())
            },
        )),
    )?;
    Ok(mappers)
}

fn demo_store() -> Result<InMemoryStore> {
    let store = InMemoryStore::new();
    for (i, env_name) in ["dev", "staging", "prod", "perf"].iter().enumerate() {
        store.insert(
            Resource::new(
                "observability.io/v1alpha1",
                "ObservabilityPlatform",
                "monitoring",
                *env_name,
            )
            .with_label("env", *env_name)
            .with_spec(json!({
                "retention": format!("{}d", 7 * (i + 1)),
                "customConfig": "scrape_interval: 15s\n".repeat(80),
                "components": {
                    "prometheus": {"replicas": 2},
                    "grafana": {"replicas": 1}
                }
            }))
            .with_status(json!({"phase": "Ready", "observedGeneration": i + 1})),
        )?;
    }
    Ok(store)
}

fn main() -> Result<()> {
    init_tracing();

    let config = match env::args().nth(1) {
        Some(path) => MigrateConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => MigrateConfig::default(),
    };

    let store = Arc::new(demo_store()?);
    let migrator = Migrator::builder(config)
        .store(store.clone())
        .mappers(Arc::new(demo_mappers()?))
        .build()
        .context("assembling the migrator")?;

    let ctx = OpContext::background();
    let filter = ListFilter::new().with_kind("ObservabilityPlatform");
    let results = match migrator.migrate_all(&ctx, &filter, "v1beta1") {
        Ok(results) => results,
        Err(err) => {
            tracing::warn!(error = %err, "migration_incomplete");
            err.into_results()
        }
    };

    let summary = json!({
        "results": results,
        "batch": migrator.processor().metrics(),
        "engine": migrator.engine().metrics(),
        "optimizer": migrator.optimizer().metrics(),
        "cache": migrator.optimizer().cache_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
