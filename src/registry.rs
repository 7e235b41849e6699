// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Object registry (component F): weak back-references from context and
//! activity rule actions to audio-server objects, (re)bound on the host's
//! NEW/PUT and UNLINK lifecycle hooks.

use crate::classify::Classifier;
use crate::context::{ContextEngine, ObjectBinding};
use crate::group::GroupTable;
use crate::host::ObjectKind;
use std::collections::HashMap;
use tracing::warn;

/// One collected object-ref binding slot, gathered from every context and
/// activity rule action at startup/config-reload time.
struct RegisteredRef {
    kind: ObjectKind,
    match_fn: crate::match_expr::MatchExpr,
    binding: ObjectBinding,
}

/// The object registry: the flat list of ref slots harvested from the
/// context engine's rule tables, plus per-index bookkeeping for sink-input
/// extension records (spec.md §4.6).
#[derive(Default)]
pub struct ObjectRegistry {
    refs: Vec<RegisteredRef>,
    stream_groups: HashMap<u32, String>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Harvest every object-ref appearing in the context engine's variable
    /// rules and activity rules so `on_new`/`on_unlink` can bind them.
    pub fn collect_refs(&mut self, engine: &ContextEngine) {
        self.refs.clear();
        for var in engine.variables() {
            for rule in &var.rules {
                for action in &rule.actions {
                    self.push_action_ref(action);
                }
            }
        }
        for activity in engine.activities() {
            for rule in activity.active_rules.iter().chain(activity.inactive_rules.iter()) {
                for action in &rule.actions {
                    self.push_action_ref(action);
                }
            }
            for action in &activity.default_state_actions {
                self.push_action_ref(action);
            }
        }
    }

    fn push_action_ref(&mut self, action: &crate::context::Action) {
        let object_ref = match action {
            crate::context::Action::SetProperty { object_ref, .. } => object_ref,
            crate::context::Action::DeleteProperty { object_ref, .. } => object_ref,
        };
        self.refs.push(RegisteredRef {
            kind: object_ref.kind,
            match_fn: object_ref.match_expr.clone(),
            binding: object_ref.binding.clone(),
        });
    }

    /// NEW/PUT hook: bind every ref of matching kind whose match accepts
    /// `name` (spec.md §4.6 step 1).
    pub fn on_new(&mut self, kind: ObjectKind, name: &str, index: u32) {
        for r in &mut self.refs {
            if r.kind != kind || !r.match_fn.matches(name) {
                continue;
            }
            let mut slot = r.binding.borrow_mut();
            match *slot {
                Some((_, existing)) if existing != index => {
                    warn!(
                        "object registry: duplicate match for {kind:?} '{name}' (already bound to {existing}, now also matches {index})"
                    );
                }
                _ => *slot = Some((kind, index)),
            }
        }
    }

    /// UNLINK hook: clear bindings pointing at `index` (spec.md §4.6 step 2).
    pub fn on_unlink(&mut self, kind: ObjectKind, index: u32) {
        for r in &mut self.refs {
            if r.kind != kind {
                continue;
            }
            let mut slot = r.binding.borrow_mut();
            if *slot == Some((kind, index)) {
                *slot = None;
            }
        }
    }

    /// Record which group a stream was placed into, for `rediscover`.
    pub fn note_stream_group(&mut self, stream_index: u32, group: &str) {
        self.stream_groups.insert(stream_index, group.to_string());
    }

    pub fn forget_stream(&mut self, stream_index: u32) {
        self.stream_groups.remove(&stream_index);
    }

    /// `rediscover`: for every stream currently in the default group,
    /// re-run classification and move it to whatever group it now matches
    /// (spec.md §4.6, SPEC_FULL.md §2.6 - also triggered by config reload).
    pub fn rediscover(
        &mut self,
        groups: &mut GroupTable,
        classifier: &Classifier,
        lookup: &dyn crate::host::UserLookup,
        stream_contexts: &HashMap<u32, (crate::host::ClientContext, crate::host::NewStreamData)>,
    ) {
        let default_name = crate::group::DEFAULT_GROUP;
        let in_default: Vec<u32> = self
            .stream_groups
            .iter()
            .filter(|(_, g)| g.as_str() == default_name)
            .map(|(&idx, _)| idx)
            .collect();

        for stream_index in in_default {
            let Some((client, new_stream)) = stream_contexts.get(&stream_index) else {
                continue;
            };
            let (new_group, _flags, _port) = classifier.classify_stream(client, new_stream, default_name, lookup);
            if new_group == default_name {
                continue;
            }
            groups.remove_sink_input(default_name, stream_index);
            groups.insert_sink_input(Some(&new_group), stream_index);
            self.stream_groups.insert(stream_index, new_group);
        }
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }
}

/// A sink-input extension record (spec.md §3): allocated on PUT, destroyed
/// on UNLINK, carrying the local flags classification assigned at creation.
pub struct SinkInputExtMap {
    entries: HashMap<u32, crate::group::SinkInputExt>,
}

impl Default for SinkInputExtMap {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl SinkInputExtMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, index: u32, local_route: bool, local_mute: bool) {
        self.entries.insert(
            index,
            crate::group::SinkInputExt {
                local_route,
                local_mute,
                corked_by_client: false,
                ignore_next_state_change: 0,
            },
        );
    }

    pub fn destroy(&mut self, index: u32) {
        self.entries.remove(&index);
    }

    pub fn get(&self, index: u32) -> Option<&crate::group::SinkInputExt> {
        self.entries.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut crate::group::SinkInputExt> {
        self.entries.get_mut(&index)
    }

    pub fn all_mut(&mut self) -> &mut HashMap<u32, crate::group::SinkInputExt> {
        &mut self.entries
    }
}
