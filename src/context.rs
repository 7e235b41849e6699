// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Context-variable / action engine (component E): named scalar variables,
//! value-matched rules that apply property actions to bound host objects,
//! and the sink-activity variant driven by sink open/close state.

use crate::host::{HostAdapter, ObjectKind};
use crate::match_expr::MatchExpr;
use crate::routing::ModuleProps;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum depth of the pending-action queue (spec.md §3, §4.5).
pub const PENDING_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("pending-change queue overflowed at capacity {0}; overflow actions were dropped")]
    QueueOverflow(usize),
}

/// Shared binding cell for an [`ObjectRef`]: written by the object registry
/// (component F) on NEW/PUT/UNLINK, read by action execution here. `Rc` +
/// `RefCell` because the registry and the context/activity engines each
/// hold their own collection of rules that reference the same bindings, and
/// the whole engine is single-threaded cooperative (spec.md §5).
pub type ObjectBinding = Rc<RefCell<Option<(ObjectKind, u32)>>>;

/// An unresolved reference to a host object, named by the kind of object
/// and a match expression evaluated against that object's name at bind time
/// (spec.md §4.6 OBJECTREF grammar).
#[derive(Clone)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub match_expr: MatchExpr,
    pub binding: ObjectBinding,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, match_expr: MatchExpr) -> Self {
        Self {
            kind,
            match_expr,
            binding: Rc::new(RefCell::new(None)),
        }
    }

    pub fn bound(&self) -> Option<(ObjectKind, u32)> {
        *self.binding.borrow()
    }
}

/// Where a `SetProperty` action's value comes from (spec.md §3).
#[derive(Debug, Clone)]
pub enum ValueSource {
    Constant(String),
    CopyFromContextValue,
}

/// One action attached to a context or activity rule (spec.md §3).
#[derive(Clone)]
pub enum Action {
    SetProperty {
        object_ref: ObjectRef,
        property: String,
        value_source: ValueSource,
    },
    DeleteProperty {
        object_ref: ObjectRef,
        property: String,
    },
}

/// A value-matched rule attached to a context variable (spec.md §3).
#[derive(Clone)]
pub struct ContextRule {
    pub value_match: MatchExpr,
    pub actions: Vec<Action>,
}

/// A named scalar variable and the rules triggered on its change (spec.md §3).
pub struct ContextVariable {
    pub name: String,
    pub last_value: Option<String>,
    pub rules: Vec<ContextRule>,
}

impl ContextVariable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_value: None,
            rules: Vec::new(),
        }
    }
}

/// A pending action captured by `on_variable_change`, awaiting `commit_pending`.
#[derive(Clone)]
struct PendingEntry {
    action: Action,
    captured_value: String,
}

/// One active/inactive rule belonging to an activity variable. Restricted
/// to `SetProperty` actions (spec.md §4.5).
#[derive(Clone)]
pub struct ActivityRule {
    pub sink_name_match: MatchExpr,
    pub actions: Vec<Action>,
}

/// A sink-activity-driven variable (spec.md §3, §4.5).
pub struct ActivityVariable {
    pub device_name: String,
    pub active_rules: Vec<ActivityRule>,
    pub inactive_rules: Vec<ActivityRule>,
    pub default_state_actions: Vec<Action>,
    pub enabled: bool,
    pub last_sink_opened: Option<bool>,
}

impl ActivityVariable {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            active_rules: Vec::new(),
            inactive_rules: Vec::new(),
            default_state_actions: Vec::new(),
            enabled: false,
            last_sink_opened: None,
        }
    }
}

/// The context/activity engine: variable tables, the bounded pending-change
/// queue, and action execution against bound host objects.
#[derive(Default)]
pub struct ContextEngine {
    variables: Vec<ContextVariable>,
    activities: Vec<ActivityVariable>,
    pending: Vec<PendingEntry>,
}

impl ContextEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, var: ContextVariable) {
        self.variables.push(var);
    }

    pub fn add_activity(&mut self, act: ActivityVariable) {
        self.activities.push(act);
    }

    pub fn variable(&self, name: &str) -> Option<&ContextVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn variables(&self) -> &[ContextVariable] {
        &self.variables
    }

    pub fn activities(&self) -> &[ActivityVariable] {
        &self.activities
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `on_variable_change` (spec.md §4.5).
    pub fn on_variable_change(&mut self, name: &str, new_value: &str) -> Result<(), ContextError> {
        let Some(var) = self.variables.iter_mut().find(|v| v.name == name) else {
            debug!("on_variable_change: no such variable '{name}', ignoring");
            return Ok(());
        };
        if var.last_value.as_deref() == Some(new_value) {
            debug!("context variable '{name}' unchanged at '{new_value}'");
            return Ok(());
        }
        var.last_value = Some(new_value.to_string());

        let mut overflowed = false;
        for rule in &var.rules {
            if !rule.value_match.matches(new_value) {
                continue;
            }
            for action in &rule.actions {
                if self.pending.len() >= PENDING_QUEUE_CAPACITY {
                    overflowed = true;
                    continue;
                }
                self.pending.push(PendingEntry {
                    action: action.clone(),
                    captured_value: new_value.to_string(),
                });
            }
        }
        if overflowed {
            warn!("pending-change queue overflowed committing variable '{name}'");
            return Err(ContextError::QueueOverflow(PENDING_QUEUE_CAPACITY));
        }
        Ok(())
    }

    /// `commit_pending`: drain the queue LIFO (spec.md §4.5, §5 ordering
    /// guarantees).
    pub fn commit_pending(&mut self, host: &mut dyn HostAdapter, module: &mut ModuleProps) {
        while let Some(entry) = self.pending.pop() {
            apply_action(&entry.action, &entry.captured_value, host, module);
        }
    }
}

fn apply_action(action: &Action, captured_value: &str, host: &mut dyn HostAdapter, module: &mut ModuleProps) {
    match action {
        Action::SetProperty {
            object_ref,
            property,
            value_source,
        } => {
            let Some((kind, index)) = object_ref.bound() else {
                return;
            };
            let value = match value_source {
                ValueSource::Constant(s) => s.clone(),
                ValueSource::CopyFromContextValue => captured_value.to_string(),
            };
            if host.get_property(kind, index, property).as_deref() == Some(value.as_str()) {
                return;
            }
            if let Err(e) = host.set_property(kind, index, property, &value) {
                warn!("context set_property failed for {kind:?} {index}: {e}");
                return;
            }
            module.broadcast(property, &value);
        }
        Action::DeleteProperty { object_ref, property } => {
            let Some((kind, index)) = object_ref.bound() else {
                return;
            };
            if let Err(e) = host.delete_property(kind, index, property) {
                warn!("context delete_property failed for {kind:?} {index}: {e}");
            }
        }
    }
}

/// `device_changed`: enable the activity whose device matches, disable all
/// others (spec.md §4.5). Disabling runs `default_state_actions` immediately.
pub fn device_changed(engine: &mut ContextEngine, device_name: &str, host: &mut dyn HostAdapter, module: &mut ModuleProps) {
    for act in &mut engine.activities {
        if act.device_name == device_name {
            if !act.enabled {
                act.enabled = true;
                act.last_sink_opened = None;
                debug!("activity '{}' enabled", act.device_name);
            }
        } else if act.enabled {
            act.enabled = false;
            act.last_sink_opened = None;
            debug!("activity '{}' disabled", act.device_name);
            for action in act.default_state_actions.clone() {
                apply_action(&action, "", host, module);
            }
        }
    }
}

/// A sink open/close transition delivered by the host (spec.md §4.5).
pub fn sink_state_changed(engine: &mut ContextEngine, sink_name: &str, opened: bool, host: &mut dyn HostAdapter, module: &mut ModuleProps) {
    for act in &mut engine.activities {
        if !act.enabled {
            continue;
        }
        if act.last_sink_opened == Some(opened) {
            continue;
        }
        act.last_sink_opened = Some(opened);

        let rules: &[ActivityRule] = if opened { &act.active_rules } else { &act.inactive_rules };
        let matching: Vec<Action> = rules
            .iter()
            .filter(|r| r.sink_name_match.matches(sink_name))
            .flat_map(|r| r.actions.iter().cloned())
            .collect();
        for action in matching {
            apply_action(&action, "", host, module);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::test_support::RecordingHost;

    fn bound_ref(kind: ObjectKind, index: u32) -> ObjectRef {
        let r = ObjectRef::new(kind, MatchExpr::True);
        *r.binding.borrow_mut() = Some((kind, index));
        r
    }

    #[test]
    fn s4_context_set_property_fires_on_match() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("call-state");
        var.rules.push(ContextRule {
            value_match: MatchExpr::Equals("active".to_string()),
            actions: vec![Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, 3),
                property: "policy.call".to_string(),
                value_source: ValueSource::Constant("1".to_string()),
            }],
        });
        engine.add_variable(var);

        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        engine.on_variable_change("call-state", "active").unwrap();
        assert_eq!(engine.pending_len(), 1);
        engine.commit_pending(&mut host, &mut module);
        assert_eq!(host.get_property(ObjectKind::Sink, 3, "policy.call"), Some("1".to_string()));
        assert_eq!(module.broadcast.get("policy.call"), Some(&"1".to_string()));
    }

    #[test]
    fn unchanged_value_is_a_no_op() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        var.last_value = Some("same".to_string());
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions: vec![Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, 1),
                property: "p".to_string(),
                value_source: ValueSource::Constant("v".to_string()),
            }],
        });
        engine.add_variable(var);
        engine.on_variable_change("x", "same").unwrap();
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn unbound_object_ref_silently_skips() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions: vec![Action::SetProperty {
                object_ref: ObjectRef::new(ObjectKind::Sink, MatchExpr::True),
                property: "p".to_string(),
                value_source: ValueSource::Constant("v".to_string()),
            }],
        });
        engine.add_variable(var);
        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        engine.on_variable_change("x", "anything").unwrap();
        engine.commit_pending(&mut host, &mut module);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn queue_overflow_drops_excess_and_reports_failure() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        let actions: Vec<Action> = (0..20)
            .map(|i| Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, i),
                property: "p".to_string(),
                value_source: ValueSource::Constant("v".to_string()),
            })
            .collect();
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions,
        });
        engine.add_variable(var);
        let err = engine.on_variable_change("x", "v1").unwrap_err();
        assert!(matches!(err, ContextError::QueueOverflow(PENDING_QUEUE_CAPACITY)));
        assert_eq!(engine.pending_len(), PENDING_QUEUE_CAPACITY);
    }

    #[test]
    fn commit_drains_in_lifo_order() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions: vec![
                Action::SetProperty {
                    object_ref: bound_ref(ObjectKind::Sink, 1),
                    property: "order".to_string(),
                    value_source: ValueSource::Constant("first".to_string()),
                },
                Action::SetProperty {
                    object_ref: bound_ref(ObjectKind::Sink, 1),
                    property: "order".to_string(),
                    value_source: ValueSource::Constant("second".to_string()),
                },
            ],
        });
        engine.add_variable(var);
        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        engine.on_variable_change("x", "v").unwrap();
        engine.commit_pending(&mut host, &mut module);
        // LIFO: "second" is enqueued last, so it is applied first, and then
        // overwritten by "first" - the final observable value is "first".
        assert_eq!(host.get_property(ObjectKind::Sink, 1, "order"), Some("first".to_string()));
        let set_calls: Vec<_> = host
            .calls
            .iter()
            .filter_map(|c| match c {
                crate::host::test_support::Call::SetProperty(_, _, k, v) if k == "order" => Some(v.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(set_calls, vec!["second".to_string(), "first".to_string()]);
    }

    #[test]
    fn copy_from_context_value_uses_captured_value() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions: vec![Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, 1),
                property: "mirrored".to_string(),
                value_source: ValueSource::CopyFromContextValue,
            }],
        });
        engine.add_variable(var);
        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        engine.on_variable_change("x", "hello").unwrap();
        engine.commit_pending(&mut host, &mut module);
        assert_eq!(host.get_property(ObjectKind::Sink, 1, "mirrored"), Some("hello".to_string()));
    }

    #[test]
    fn delete_property_unsets_when_bound() {
        let mut engine = ContextEngine::new();
        let mut var = ContextVariable::new("x");
        var.rules.push(ContextRule {
            value_match: MatchExpr::True,
            actions: vec![Action::DeleteProperty {
                object_ref: bound_ref(ObjectKind::Sink, 1),
                property: "stale".to_string(),
            }],
        });
        engine.add_variable(var);
        let mut host = RecordingHost::default();
        host.set_property(ObjectKind::Sink, 1, "stale", "x").unwrap();
        let mut module = ModuleProps::default();
        engine.on_variable_change("x", "go").unwrap();
        engine.commit_pending(&mut host, &mut module);
        assert_eq!(host.get_property(ObjectKind::Sink, 1, "stale"), None);
    }

    #[test]
    fn s6_activity_device_changed_enables_one_and_disables_others() {
        let mut engine = ContextEngine::new();
        let mut hands_free = ActivityVariable::new("handsfree");
        hands_free.active_rules.push(ActivityRule {
            sink_name_match: MatchExpr::True,
            actions: vec![Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, 7),
                property: "policy.activity".to_string(),
                value_source: ValueSource::Constant("handsfree".to_string()),
            }],
        });
        let mut speaker = ActivityVariable::new("speaker");
        speaker.default_state_actions.push(Action::SetProperty {
            object_ref: bound_ref(ObjectKind::Sink, 8),
            property: "policy.activity".to_string(),
            value_source: ValueSource::Constant("off".to_string()),
        });
        speaker.enabled = true;
        engine.add_activity(hands_free);
        engine.add_activity(speaker);

        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        device_changed(&mut engine, "handsfree", &mut host, &mut module);

        assert!(engine.activities()[0].enabled);
        assert!(!engine.activities()[1].enabled);
        assert_eq!(host.get_property(ObjectKind::Sink, 8, "policy.activity"), Some("off".to_string()));
    }

    #[test]
    fn repeated_identical_sink_transitions_are_suppressed() {
        let mut engine = ContextEngine::new();
        let mut act = ActivityVariable::new("handsfree");
        act.enabled = true;
        act.active_rules.push(ActivityRule {
            sink_name_match: MatchExpr::True,
            actions: vec![Action::SetProperty {
                object_ref: bound_ref(ObjectKind::Sink, 1),
                property: "count".to_string(),
                value_source: ValueSource::Constant("opened".to_string()),
            }],
        });
        engine.add_activity(act);
        let mut host = RecordingHost::default();
        let mut module = ModuleProps::default();
        sink_state_changed(&mut engine, "hf-sink", true, &mut host, &mut module);
        sink_state_changed(&mut engine, "hf-sink", true, &mut host, &mut module);
        let fires = host
            .calls
            .iter()
            .filter(|c| matches!(c, crate::host::test_support::Call::SetProperty(_, _, k, _) if k == "count"))
            .count();
        assert_eq!(fires, 1);
    }
}
