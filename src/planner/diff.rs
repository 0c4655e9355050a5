//! Diff engine for comparing desired vs. current state.
//!
//! Current state is the last-applied record from the state store, optionally
//! corrected by a drift report from the prober. Declared attributes are
//! compared structurally; provider outputs are never compared.
//!
//! Attributes that interpolate `${type.name.attribute}` are also compared by
//! their resolved value, and a resource whose referenced upstream value is
//! about to change is planned as an update.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::model::{Reference, Resource, ResourceId, Value, resolve_value, scan_references};
use crate::provider::{Drift, DriftReport};
use crate::state::ResourceState;

use super::plan::{Action, ActionKind, AttributeChange, ChangePlan};

/// Engine for computing change plans.
#[derive(Debug, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the change plan for a desired resource set.
    #[must_use]
    pub fn compute(
        &self,
        desired: &[Resource],
        current: &BTreeMap<ResourceId, ResourceState>,
        drift: Option<&DriftReport>,
    ) -> ChangePlan {
        let mut actions = Vec::with_capacity(desired.len() + current.len());
        let declared: BTreeSet<&ResourceId> = desired.iter().map(|r| &r.id).collect();

        for resource in desired {
            let observed = drift.and_then(|d| d.get(&resource.id));
            let action = Self::diff_resource(resource, current, observed);
            debug!("{}: {}", resource.id, action.kind);
            actions.push(action);
        }

        for id in current.keys().filter(|id| !declared.contains(id)) {
            debug!("{id}: {}", ActionKind::Delete);
            actions.push(Action::new(id.clone(), ActionKind::Delete, "no longer declared"));
        }

        let mut plan = ChangePlan::new(actions);
        Self::propagate_upstream_changes(desired, current, &mut plan);
        plan
    }

    /// Promotes no-ops to updates while any of their references points at a
    /// value that the plan is about to change. Repeats until stable so that
    /// chains of references are followed.
    fn propagate_upstream_changes(
        desired: &[Resource],
        current: &BTreeMap<ResourceId, ResourceState>,
        plan: &mut ChangePlan,
    ) {
        let by_id: BTreeMap<&ResourceId, &Resource> = desired.iter().map(|r| (&r.id, r)).collect();

        loop {
            let mut promoted = Vec::new();

            for resource in desired {
                if plan.get(&resource.id).is_none_or(|a| a.kind != ActionKind::NoOp) {
                    continue;
                }

                let mut names = Vec::new();
                let mut sources = BTreeSet::new();
                for (name, value) in &resource.attributes {
                    let changed: Vec<Reference> = scan_references(value)
                        .into_iter()
                        .filter(|r| Self::reference_changes(plan, &by_id, r))
                        .collect();
                    if !changed.is_empty() {
                        names.push(name.clone());
                        sources.extend(changed.into_iter().map(|r| r.target.to_string()));
                    }
                }

                if !names.is_empty() {
                    promoted.push((resource, names, sources));
                }
            }

            if promoted.is_empty() {
                return;
            }

            for (resource, names, sources) in promoted {
                let stored = current.get(&resource.id);
                let changes = names
                    .into_iter()
                    .map(|name| AttributeChange {
                        old: stored.and_then(|s| s.applied.get(&name)).cloned(),
                        new: resource.attributes.get(&name).cloned(),
                        name,
                    })
                    .collect();
                let reason = format!("depends on changing {}", sources.into_iter().collect::<Vec<_>>().join(", "));
                debug!("{}: {} ({reason})", resource.id, ActionKind::Update);

                if let Some(action) = plan.actions.iter_mut().find(|a| a.id == resource.id) {
                    action.kind = ActionKind::Update;
                    action.changes = changes;
                    action.reason = reason;
                }
            }
        }
    }

    /// Returns true if the planned action of the referenced resource may
    /// change the referenced value.
    fn reference_changes(
        plan: &ChangePlan,
        desired: &BTreeMap<&ResourceId, &Resource>,
        reference: &Reference,
    ) -> bool {
        let Some(action) = plan.get(&reference.target) else {
            return false;
        };

        match action.kind {
            ActionKind::Create => true,
            ActionKind::Update => {
                // Outputs are only known after apply
                let declared = desired
                    .get(&reference.target)
                    .is_some_and(|r| r.attributes.contains_key(&reference.attribute));
                !declared || action.changes.iter().any(|c| c.name == reference.attribute)
            }
            ActionKind::Delete | ActionKind::NoOp => false,
        }
    }

    /// Resolves an attribute's references against recorded state.
    ///
    /// Returns `None` when the attribute has no references or when a
    /// referenced value is not recorded yet.
    fn resolve_recorded(value: &Value, current: &BTreeMap<ResourceId, ResourceState>) -> Option<Value> {
        if scan_references(value).is_empty() {
            return None;
        }

        let lookup = |reference: &Reference| {
            current
                .get(&reference.target)
                .and_then(|state| state.lookup(&reference.attribute))
                .cloned()
        };
        resolve_value(value, &lookup).ok()
    }

    /// Computes the action for one declared resource.
    fn diff_resource(
        resource: &Resource,
        current: &BTreeMap<ResourceId, ResourceState>,
        drift: Option<&Drift>,
    ) -> Action {
        let Some(stored) = current.get(&resource.id) else {
            return Action::new(resource.id.clone(), ActionKind::Create, "not yet created");
        };

        let drifted = match drift {
            Some(Drift::Missing) => {
                return Action::new(resource.id.clone(), ActionKind::Create, "missing on target");
            }
            Some(Drift::Changed { attributes }) => Some(attributes),
            None => None,
        };

        let mut changes: BTreeMap<String, AttributeChange> = BTreeMap::new();
        let mut upstream_names = Vec::new();

        for (name, new) in &resource.attributes {
            let old = stored.attributes.get(name);
            if !old.is_some_and(|old| old.equivalent(new)) {
                changes.insert(
                    name.clone(),
                    AttributeChange {
                        name: name.clone(),
                        old: old.cloned(),
                        new: Some(new.clone()),
                    },
                );
                continue;
            }

            // Same template, but the values it resolves to may have moved
            let applied = stored.applied.get(name);
            if let Some(resolved) = Self::resolve_recorded(new, current)
                && !applied.is_some_and(|applied| applied.equivalent(&resolved))
            {
                upstream_names.push(name.clone());
                changes.insert(
                    name.clone(),
                    AttributeChange {
                        name: name.clone(),
                        old: applied.cloned(),
                        new: Some(new.clone()),
                    },
                );
            }
        }

        for (name, old) in &stored.attributes {
            if !resource.attributes.contains_key(name) {
                changes.insert(
                    name.clone(),
                    AttributeChange {
                        name: name.clone(),
                        old: Some(old.clone()),
                        new: None,
                    },
                );
            }
        }

        let declared_changes: Vec<String> = changes
            .keys()
            .filter(|name| !upstream_names.contains(*name))
            .cloned()
            .collect();
        let mut drifted_names = Vec::new();

        if let Some(drifted) = drifted {
            for (name, observed) in drifted {
                let Some(new) = resource.attributes.get(name) else {
                    continue;
                };
                drifted_names.push(name.clone());
                changes.insert(
                    name.clone(),
                    AttributeChange {
                        name: name.clone(),
                        old: observed.clone(),
                        new: Some(new.clone()),
                    },
                );
            }
        }

        if changes.is_empty() {
            return Action::new(resource.id.clone(), ActionKind::NoOp, "up to date");
        }

        let reason = [
            ("changed", &declared_changes),
            ("upstream changed", &upstream_names),
            ("drifted", &drifted_names),
        ]
        .into_iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(label, names)| format!("{label}: {}", names.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");

        Action {
            id: resource.id.clone(),
            kind: ActionKind::Update,
            changes: changes.into_values().collect(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    fn resource(name: &str) -> Resource {
        Resource::new(ResourceId::new("file", name))
            .with_attribute("content", "hello")
            .with_attribute("mode", 420_i64)
    }

    fn stored(resource: &Resource) -> ResourceState {
        ResourceState::new(resource.id.clone(), resource.attributes.clone())
    }

    fn current(states: &[ResourceState]) -> BTreeMap<ResourceId, ResourceState> {
        states.iter().map(|s| (s.id.clone(), s.clone())).collect()
    }

    #[test]
    fn test_create_when_absent() {
        let plan = DiffEngine::new().compute(&[resource("motd")], &BTreeMap::new(), None);

        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::Create);
    }

    #[test]
    fn test_noop_when_equal() {
        let r = resource("motd");
        let plan = DiffEngine::new().compute(&[r.clone()], &current(&[stored(&r)]), None);

        assert!(plan.is_empty());
        assert_eq!(plan.actions[0].kind, ActionKind::NoOp);
    }

    #[test]
    fn test_update_lists_exactly_changed_attributes() {
        let before = resource("motd");
        let after = before
            .clone()
            .with_attribute("content", "goodbye")
            .with_attribute("owner", "root");

        let plan = DiffEngine::new().compute(&[after], &current(&[stored(&before)]), None);
        let action = &plan.actions[0];

        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.changed_names(), vec!["content", "owner"]);
        assert_eq!(action.changes[0].old, Some(Value::from("hello")));
        assert_eq!(action.changes[1].old, None);
    }

    #[test]
    fn test_removed_attribute_is_update() {
        let before = resource("motd");
        let mut after = before.clone();
        after.attributes.remove("mode");

        let plan = DiffEngine::new().compute(&[after], &current(&[stored(&before)]), None);
        let action = &plan.actions[0];

        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(
            action.changes,
            vec![AttributeChange {
                name: String::from("mode"),
                old: Some(Value::Int(420)),
                new: None,
            }]
        );
    }

    #[test]
    fn test_set_order_is_not_a_change() {
        let before = Resource::new(ResourceId::new("group", "ops"))
            .with_attribute("members", Value::Set(vec![Value::from("a"), Value::from("b")]));
        let after = Resource::new(ResourceId::new("group", "ops"))
            .with_attribute("members", Value::Set(vec![Value::from("b"), Value::from("a")]));

        let plan = DiffEngine::new().compute(&[after], &current(&[stored(&before)]), None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_delete_when_undeclared() {
        let kept = resource("kept");
        let gone = resource("gone");

        let plan = DiffEngine::new().compute(&[kept.clone()], &current(&[stored(&kept), stored(&gone)]), None);

        assert_eq!(plan.count(ActionKind::Delete), 1);
        assert_eq!(plan.get(&gone.id).map(|a| a.kind), Some(ActionKind::Delete));
    }

    #[test]
    fn test_outputs_are_not_compared() {
        let r = resource("motd");
        let state = stored(&r).with_outputs(BTreeMap::from([(String::from("uid"), Value::from("x"))]));

        let plan = DiffEngine::new().compute(&[r], &current(&[state]), None);
        assert!(plan.is_empty());
    }

    fn svc(name: &str) -> Resource {
        Resource::new(ResourceId::new("svc", name))
    }

    fn applied(resource: &Resource, applied: &[(&str, Value)]) -> ResourceState {
        stored(resource).with_applied(applied.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect())
    }

    #[test]
    fn test_changed_upstream_value_updates_dependents() {
        let a_before = svc("a").with_attribute("port", 80_i64).with_attribute("name", "a");
        let b = svc("b").with_attribute("p", "${svc.a.port}");
        let c = svc("c").with_attribute("url", "http://host:${svc.b.p}");
        let state = current(&[
            stored(&a_before),
            applied(&b, &[("p", Value::Int(80))]),
            applied(&c, &[("url", Value::from("http://host:80"))]),
        ]);

        let a_after = a_before.clone().with_attribute("port", 81_i64);
        let plan = DiffEngine::new().compute(&[a_after, b.clone(), c.clone()], &state, None);

        let b_action = plan.get(&b.id).expect("b");
        assert_eq!(b_action.kind, ActionKind::Update);
        assert_eq!(b_action.reason, "depends on changing svc.a");
        assert_eq!(b_action.changes[0].old, Some(Value::Int(80)));
        assert_eq!(plan.get(&c.id).map(|a| a.kind), Some(ActionKind::Update));
    }

    #[test]
    fn test_unrelated_upstream_change_keeps_noop() {
        let a_before = svc("a").with_attribute("port", 80_i64).with_attribute("name", "a");
        let b = svc("b").with_attribute("p", "${svc.a.port}");
        let state = current(&[stored(&a_before), applied(&b, &[("p", Value::Int(80))])]);

        let a_after = a_before.clone().with_attribute("name", "renamed");
        let plan = DiffEngine::new().compute(&[a_after, b.clone()], &state, None);

        assert_eq!(plan.get(&a_before.id).map(|a| a.kind), Some(ActionKind::Update));
        assert_eq!(plan.get(&b.id).map(|a| a.kind), Some(ActionKind::NoOp));
    }

    #[test]
    fn test_stale_resolved_value_is_update() {
        // Upstream already converged but the dependent was never re-applied
        let a = svc("a").with_attribute("port", 81_i64);
        let b = svc("b").with_attribute("p", "${svc.a.port}");
        let state = current(&[stored(&a), applied(&b, &[("p", Value::Int(80))])]);

        let plan = DiffEngine::new().compute(&[a, b.clone()], &state, None);
        let action = plan.get(&b.id).expect("b");

        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.reason, "upstream changed: p");
        assert_eq!(action.changes[0].old, Some(Value::Int(80)));
        assert_eq!(action.changes[0].new, Some(Value::from("${svc.a.port}")));
    }

    #[test]
    fn test_upstream_create_updates_dependent() {
        let b = svc("b").with_attribute("peer", "${svc.a.uid}");
        let state = current(&[applied(&b, &[("peer", Value::from("mem-1"))])]);

        let plan = DiffEngine::new().compute(&[svc("a"), b.clone()], &state, None);
        assert_eq!(plan.get(&b.id).map(|a| a.kind), Some(ActionKind::Update));
    }

    #[test]
    fn test_missing_on_target_is_create() {
        let r = resource("motd");
        let drift = DriftReport {
            entries: BTreeMap::from([(r.id.clone(), Drift::Missing)]),
            checked: 1,
        };

        let plan = DiffEngine::new().compute(&[r.clone()], &current(&[stored(&r)]), Some(&drift));
        assert_eq!(plan.actions[0].kind, ActionKind::Create);
        assert_eq!(plan.actions[0].reason, "missing on target");
    }

    #[test]
    fn test_drifted_attribute_is_update() {
        let r = resource("motd");
        let drift = DriftReport {
            entries: BTreeMap::from([(
                r.id.clone(),
                Drift::Changed {
                    attributes: BTreeMap::from([(String::from("mode"), Some(Value::Int(511)))]),
                },
            )]),
            checked: 1,
        };

        let plan = DiffEngine::new().compute(&[r.clone()], &current(&[stored(&r)]), Some(&drift));
        let action = &plan.actions[0];

        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.changes[0].old, Some(Value::Int(511)));
        assert_eq!(action.changes[0].new, Some(Value::Int(420)));
        assert_eq!(action.reason, "drifted: mode");
    }
}
