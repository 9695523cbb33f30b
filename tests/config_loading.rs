mod common;

use std::io::Write;
use std::sync::Arc;

use common::{seeded_store, KIND};
use schemashift::resource::{FnMapper, MapperError};
use schemashift::{
    BatchStatus, ConfigLoadError, ListFilter, MapperRegistry, MigrateConfig, Migrator, OpContext,
    Resource, ResourceStore,
};
use serde_json::json;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
version: "1.0"
name: "observability v1alpha1 -> v1beta1"
policy:
  use_default_policies: false
  policies:
    - name: "keep-retention"
      priority: 95
      rules:
        - name: "retention"
          field_pattern: "^Spec\\.Retention$"
          strategy: "annotation"
          priority: 95
batch:
  max_workers: 2
  batch_size: 2
  backoff_base_ms: 1
  timeout_secs: 30
optimizer:
  sweep_interval_secs: 0
"#;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

/// v1beta1 dropped `retention`; only preservation brings it back.
fn dropping_mappers() -> MapperRegistry {
    let mappers = MapperRegistry::new();
    mappers
        .register(
            "v1alpha1",
            "v1beta1",
            Arc::new(FnMapper::new(
                |object: &mut Resource| -> Result<(), MapperError> {
                    object.remove_field("spec.retention")?;
                    Ok(())
                },
                |_: &mut Resource| -> Result<(), MapperError> { Ok(()) },
            )),
        )
        .unwrap();
    mappers
}

#[test]
fn file_configured_migration_runs_end_to_end() {
    let file = write_config(CONFIG);
    let config = MigrateConfig::from_file(file.path()).unwrap();
    assert_eq!(config.batch.max_workers, 2);
    assert_eq!(config.policy.policies.len(), 1);

    let store = Arc::new(seeded_store(5));
    let migrator = Migrator::builder(config)
        .store(store.clone())
        .mappers(Arc::new(dropping_mappers()))
        .build()
        .unwrap();
    assert_eq!(migrator.engine().manager().policies().len(), 1);

    let results = migrator
        .migrate_all(&OpContext::background(), &ListFilter::new().with_kind(KIND), "v1beta1")
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.status == BatchStatus::Success));
    assert_eq!(migrator.processor().metrics().total_batches, 3);

    let migrated = store.list(&OpContext::background(), &ListFilter::new()).unwrap();
    for object in migrated {
        assert_eq!(object.api_version(), "observability.io/v1beta1");
        assert_eq!(object.get_field("Spec.Retention").unwrap(), Some(&json!("7d")));
        assert_eq!(object.get_field("Status.Phase").unwrap(), Some(&json!("Ready")));
    }
}

#[test]
fn missing_file_is_a_read_error() {
    let err = MigrateConfig::from_file("/nonexistent/schemashift.yaml").unwrap_err();
    assert!(matches!(err, ConfigLoadError::FileRead(_)));
}

#[test]
fn unknown_version_is_rejected() {
    let file = write_config("version: \"2.0\"\n");
    let err = MigrateConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigLoadError::UnsupportedVersion(v) if v == "2.0"));
}

#[test]
fn policy_with_unknown_strategy_fails_at_build_time() {
    let yaml = CONFIG.replace("strategy: \"annotation\"", "strategy: \"teleport\"");
    let config = MigrateConfig::from_yaml(&yaml).unwrap();
    let built = Migrator::builder(config)
        .store(Arc::new(seeded_store(0)))
        .mappers(Arc::new(MapperRegistry::with_passthrough()))
        .build();
    assert!(built.is_err());
}
