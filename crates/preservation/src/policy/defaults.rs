use serde_json::json;

use super::{Policy, PolicyAction, PolicyCondition, PolicyRule};

/// The standard policy set. Every strategy it names is part of
/// [`StrategyRegistry::with_defaults`](crate::StrategyRegistry::with_defaults).
///
/// `field_size_threshold` is the byte size above which `CustomConfig`
/// fields move into annotations.
pub fn default_policies(field_size_threshold: usize) -> Vec<Policy> {
    vec![
        Policy::new("preserve-status", 100)
            .with_description("Preserve status fields during conversion")
            .with_rule(PolicyRule::new("status-fields", r"^Status\.", "deep-copy", 100)),
        Policy::new("preserve-metadata", 90)
            .with_description("Preserve finalizers and owner references")
            .with_rule(PolicyRule::new("finalizers", r"(^|\.)Finalizers$", "deep-copy", 100))
            .with_rule(PolicyRule::new(
                "owner-references",
                r"(^|\.)OwnerReferences$",
                "deep-copy",
                100,
            )),
        Policy::new("preserve-user-annotations", 80)
            .with_description("Merge user annotations with whatever the new version writes")
            .with_rule(
                PolicyRule::new("user-annotations", r"(^|\.)Annotations$", "merge", 80).with_condition(
                    PolicyCondition::new("field", "", "not-contains", json!("observability.io/")),
                ),
            ),
        Policy::new("preserve-large-fields", 70)
            .with_description("Store large fields in annotations")
            .with_rule(
                PolicyRule::new("large-custom-config", "CustomConfig$", "annotation", 70)
                    .with_condition(PolicyCondition::new(
                        "size",
                        "",
                        "greater-than",
                        json!(field_size_threshold),
                    ))
                    .with_action(PolicyAction::new(
                        "log",
                        "",
                        json!("large custom config stored in annotation"),
                    )),
            ),
        Policy::new("version-specific-handling", 60)
            .with_description("Route v1alpha1 fields through the versioned strategy")
            .with_rule(
                PolicyRule::new("v1alpha1-to-v1beta1", ".*", "versioned", 60).with_condition(
                    PolicyCondition::new("version", "", "equals", json!("v1alpha1")),
                ),
            ),
        Policy::new("sensitive-data-handling", 100)
            .with_description("Keep credentials out of annotations")
            .with_rule(
                PolicyRule::new("password-fields", "(?i)(password|secret|key|token)", "deep-copy", 100)
                    .with_action(PolicyAction::new("annotate", "sensitive", json!("true")))
                    .with_action(
                        PolicyAction::new("log", "", json!("sensitive field preserved in memory only"))
                            .with_metadata("level", "warn"),
                    )
                    .with_action(PolicyAction::new("metric", "sensitive_fields_preserved", json!(1))),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use resource::Resource;

    use super::*;
    use crate::field::FieldDescriptor;
    use crate::policy::{PolicyManager, RecordingEvents};
    use crate::registry::{StrategyRegistry, DEFAULT_ANNOTATION_BASE};

    fn manager() -> PolicyManager {
        let registry = Arc::new(StrategyRegistry::with_defaults(DEFAULT_ANNOTATION_BASE, 1024).unwrap());
        let manager = PolicyManager::new(registry, Arc::new(RecordingEvents::new()));
        manager.register_policies(default_policies(1024)).unwrap();
        manager
    }

    fn decide(manager: &PolicyManager, object: &Resource, path: &str, value: serde_json::Value) -> Option<String> {
        let mut field = FieldDescriptor::new(path, value);
        manager
            .apply_policies(object, &mut field)
            .unwrap()
            .decision
            .map(|d| d.rule)
    }

    #[test]
    fn defaults_register_against_default_strategies() {
        assert_eq!(manager().policies().len(), 6);
    }

    #[test]
    fn default_routing() {
        let manager = manager();
        let beta = Resource::new("example.io/v1beta1", "Widget", "default", "w");
        let alpha = Resource::new("example.io/v1alpha1", "Widget", "default", "w");

        assert_eq!(decide(&manager, &beta, "Status.Phase", json!("Ready")).as_deref(), Some("status-fields"));
        assert_eq!(decide(&manager, &beta, "Spec.CustomConfig", json!("x".repeat(2048))).as_deref(), Some("large-custom-config"));
        assert_eq!(decide(&manager, &beta, "Spec.CustomConfig", json!("small")), None);
        assert_eq!(decide(&manager, &beta, "Spec.ApiToken", json!("t")).as_deref(), Some("password-fields"));
        assert_eq!(decide(&manager, &alpha, "Spec.Replicas", json!(3)).as_deref(), Some("v1alpha1-to-v1beta1"));
        assert_eq!(decide(&manager, &beta, "Spec.Replicas", json!(3)), None);
    }

    #[test]
    fn observability_annotations_are_not_merged() {
        let manager = manager();
        let beta = Resource::new("example.io/v1beta1", "Widget", "default", "w");
        assert_eq!(
            decide(&manager, &beta, "Metadata.Annotations", json!({"team": "a"})).as_deref(),
            Some("user-annotations")
        );
        assert_eq!(
            decide(&manager, &beta, "Metadata.Annotations", json!({"observability.io/trace": "on"})),
            None
        );
    }
}
