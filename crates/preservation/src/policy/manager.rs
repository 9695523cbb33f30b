use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use resource::Resource;
use tracing::{debug, warn};

use super::action::{self, ActionScope, PreservationEvents};
use super::condition::{CompiledCondition, CustomPredicate};
use super::{ActionType, Policy, PolicyAction, PolicyRule};
use crate::error::PreservationError;
use crate::field::FieldDescriptor;
use crate::registry::StrategyRegistry;
use crate::strategy::PreservationStrategy;

/// The rule that won for a field, and the strategy it names.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub policy: String,
    pub rule: String,
    pub strategy_name: String,
    pub strategy: Arc<PreservationStrategy>,
    pub effective_priority: i64,
}

/// Result of one [`PolicyManager::apply_policies`] call. `decision` is
/// `None` when no enabled rule matched.
#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub decision: Option<PolicyDecision>,
    pub policies_evaluated: u64,
    pub rules_evaluated: u64,
    pub rules_matched: u64,
}

struct CompiledRule {
    rule: PolicyRule,
    pattern: Regex,
    conditions: Vec<CompiledCondition>,
    actions: Vec<(ActionType, PolicyAction)>,
}

struct CompiledPolicy {
    policy: Policy,
    rules: Vec<CompiledRule>,
}

struct Candidate<'a> {
    effective_priority: i64,
    policy: &'a CompiledPolicy,
    rule: &'a CompiledRule,
}

/// Ordered set of policies, validated against a strategy registry at
/// registration time.
pub struct PolicyManager {
    registry: Arc<StrategyRegistry>,
    events: Arc<dyn PreservationEvents>,
    policies: RwLock<Vec<Arc<CompiledPolicy>>>,
    predicates: RwLock<BTreeMap<String, CustomPredicate>>,
}

impl PolicyManager {
    pub fn new(registry: Arc<StrategyRegistry>, events: Arc<dyn PreservationEvents>) -> Self {
        Self {
            registry,
            events,
            policies: RwLock::new(Vec::new()),
            predicates: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    /// Make a predicate available to `custom` conditions. Must happen before
    /// any policy that references it is registered.
    pub fn register_predicate<F>(&self, name: impl Into<String>, predicate: F) -> Result<(), PreservationError>
    where
        F: Fn(&Resource, &FieldDescriptor) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let mut guard = self.predicates.write().map_err(|_| poisoned())?;
        if guard.contains_key(&name) {
            return Err(PreservationError::InvalidConfiguration(format!(
                "custom condition `{name}` is already registered"
            )));
        }
        guard.insert(name, Arc::new(predicate));
        Ok(())
    }

    pub fn register_policy(&self, policy: Policy) -> Result<(), PreservationError> {
        let compiled = self.compile(policy)?;
        let mut guard = self.policies.write().map_err(|_| poisoned())?;
        if guard.iter().any(|p| p.policy.name == compiled.policy.name) {
            return Err(PreservationError::DuplicatePolicy(compiled.policy.name));
        }
        debug!(
            policy = %compiled.policy.name,
            rules = compiled.rules.len(),
            priority = compiled.policy.priority,
            "policy_registered"
        );
        guard.push(Arc::new(compiled));
        Ok(())
    }

    pub fn register_policies(
        &self,
        policies: impl IntoIterator<Item = Policy>,
    ) -> Result<(), PreservationError> {
        policies
            .into_iter()
            .try_for_each(|policy| self.register_policy(policy))
    }

    pub fn policy(&self, name: &str) -> Option<Policy> {
        self.policies
            .read()
            .ok()?
            .iter()
            .find(|p| p.policy.name == name)
            .map(|p| p.policy.clone())
    }

    /// Registered policies in registration order.
    pub fn policies(&self) -> Vec<Policy> {
        self.policies
            .read()
            .map(|guard| guard.iter().map(|p| p.policy.clone()).collect())
            .unwrap_or_default()
    }

    fn compile(&self, policy: Policy) -> Result<CompiledPolicy, PreservationError> {
        let name = policy.name.clone();
        if name.trim().is_empty() {
            return Err(PreservationError::invalid_policy(&name, "policy name must not be empty"));
        }
        if policy.rules.is_empty() {
            return Err(PreservationError::invalid_policy(&name, "policy has no rules"));
        }

        let predicates = self.predicates.read().map_err(|_| poisoned())?;
        let lookup = |key: &str| predicates.get(key).cloned();

        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            if rule.name.trim().is_empty() {
                return Err(PreservationError::invalid_policy(&name, "rule name must not be empty"));
            }
            let pattern = Regex::new(&rule.field_pattern).map_err(|e| {
                PreservationError::invalid_policy(
                    &name,
                    format!("rule `{}`: bad field pattern `{}`: {e}", rule.name, rule.field_pattern),
                )
            })?;
            if !self.registry.contains(&rule.strategy) {
                return Err(PreservationError::invalid_policy(
                    &name,
                    format!("rule `{}` references unregistered strategy `{}`", rule.name, rule.strategy),
                ));
            }
            let conditions = rule
                .conditions
                .iter()
                .map(|condition| CompiledCondition::compile(&name, condition, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            let actions = rule
                .actions
                .iter()
                .map(|action| {
                    let kind: ActionType = action
                        .kind
                        .parse()
                        .map_err(|reason: String| PreservationError::invalid_policy(&name, reason))?;
                    if kind == ActionType::Annotate && action.target.trim().is_empty() {
                        return Err(PreservationError::invalid_policy(
                            &name,
                            format!("rule `{}`: annotate action needs a target", rule.name),
                        ));
                    }
                    Ok((kind, action.clone()))
                })
                .collect::<Result<Vec<_>, PreservationError>>()?;

            rules.push(CompiledRule {
                rule: rule.clone(),
                pattern,
                conditions,
                actions,
            });
        }
        drop(predicates);
        Ok(CompiledPolicy { policy, rules })
    }

    /// Pick the highest-priority matching rule for `field` and run its
    /// actions. Ties on effective priority go to the rule whose name sorts
    /// first, then to the policy whose name sorts first.
    pub fn apply_policies(
        &self,
        object: &Resource,
        field: &mut FieldDescriptor,
    ) -> Result<PolicyOutcome, PreservationError> {
        let policies: Vec<Arc<CompiledPolicy>> =
            self.policies.read().map_err(|_| poisoned())?.clone();

        let mut outcome = PolicyOutcome::default();
        let mut best: Option<Candidate<'_>> = None;

        for compiled in policies.iter().filter(|p| p.policy.enabled) {
            outcome.policies_evaluated += 1;
            for rule in compiled.rules.iter().filter(|r| r.rule.enabled) {
                outcome.rules_evaluated += 1;
                if !rule.pattern.is_match(&field.path) || !conditions_hold(rule, object, field) {
                    continue;
                }
                outcome.rules_matched += 1;
                let candidate = Candidate {
                    effective_priority: i64::from(rule.rule.priority) + i64::from(compiled.policy.priority),
                    policy: compiled,
                    rule,
                };
                if best.as_ref().is_none_or(|current| outranks(&candidate, current)) {
                    best = Some(candidate);
                }
            }
        }

        let Some(winner) = best else {
            debug!(field = %field.path, "no_policy_decision");
            return Ok(outcome);
        };

        let scope = ActionScope {
            policy: &winner.policy.policy.name,
            rule: &winner.rule.rule.name,
            object,
        };
        for (kind, action) in &winner.rule.actions {
            if let Err(err) = action::execute(*kind, action, &scope, field, self.events.as_ref()) {
                warn!(
                    error = %err,
                    policy = scope.policy,
                    rule = scope.rule,
                    action = %kind,
                    field = %field.path,
                    "policy_action_failed"
                );
            }
        }

        let strategy_name = winner.rule.rule.strategy.clone();
        let strategy = self.registry.get(&strategy_name)?;
        debug!(
            field = %field.path,
            policy = scope.policy,
            rule = scope.rule,
            strategy = %strategy_name,
            priority = winner.effective_priority,
            "policy_decision"
        );
        outcome.decision = Some(PolicyDecision {
            policy: scope.policy.to_string(),
            rule: scope.rule.to_string(),
            strategy_name,
            strategy,
            effective_priority: winner.effective_priority,
        });
        Ok(outcome)
    }
}

impl std::fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyManager")
            .field("policies", &self.policies().iter().map(|p| p.name.clone()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn outranks(candidate: &Candidate<'_>, current: &Candidate<'_>) -> bool {
    candidate
        .effective_priority
        .cmp(&current.effective_priority)
        .then_with(|| current.rule.rule.name.cmp(&candidate.rule.rule.name))
        .then_with(|| current.policy.policy.name.cmp(&candidate.policy.policy.name))
        .is_gt()
}

/// Every condition must hold. An evaluation error counts as "does not hold".
fn conditions_hold(rule: &CompiledRule, object: &Resource, field: &FieldDescriptor) -> bool {
    rule.conditions.iter().all(|condition| match condition.evaluate(object, field) {
        Ok(held) => held,
        Err(err) => {
            debug!(rule = %rule.rule.name, field = %field.path, error = %err, "condition_not_evaluable");
            false
        }
    })
}

fn poisoned() -> PreservationError {
    PreservationError::InvalidConfiguration("poisoned lock".into())
}
