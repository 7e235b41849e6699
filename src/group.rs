// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Policy groups (component C): the named group set, their membership, and
//! the routing/volume/cork/mute semantics applied collectively to members.

use crate::classify::StreamLocalFlags;
use bitflags::bitflags;
use std::collections::HashMap;
use tracing::debug;

/// Name of the always-present catch-all group (spec.md §3).
pub const DEFAULT_GROUP: &str = "othermedia";

/// Bucket mask and polynomial multiplier from spec.md §3: 64 buckets,
/// `hash(name) & 0x3F`, constant multiplier 38501.
const HASH_BUCKETS: u32 = 64;
const HASH_MULTIPLIER: u32 = 38501;

/// Polynomial hash of a group name, as specified in spec.md §3.
pub fn polynomial_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for b in name.bytes() {
        h = h.wrapping_mul(HASH_MULTIPLIER).wrapping_add(b as u32);
    }
    h
}

fn bucket_of(name: &str) -> usize {
    (polynomial_hash(name) & (HASH_BUCKETS - 1)) as usize
}

bitflags! {
    /// Group policy flags (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GroupFlags: u32 {
        const SET_SINK      = 0b0000001;
        const SET_SOURCE    = 0b0000010;
        const ROUTE_AUDIO   = 0b0000100;
        const LIMIT_VOLUME  = 0b0001000;
        const CORK_STREAM   = 0b0010000;
        const MUTE_BY_ROUTE = 0b0100000;
        const MEDIA_NOTIFY  = 0b1000000;
    }
}

impl GroupFlags {
    /// The `client` config synonym: routing + cork, no forced sink/volume
    /// limiting (SPEC_FULL.md §2.1).
    pub fn client_synonym() -> Self {
        Self::ROUTE_AUDIO | Self::CORK_STREAM
    }
}

/// A single policy group (spec.md §3).
#[derive(Debug, Clone)]
pub struct PolicyGroup {
    pub name: String,
    pub flags: GroupFlags,
    pub default_sink: Option<u32>,
    pub default_source: Option<u32>,
    pub preferred_sink_name: Option<String>,
    pub preferred_source_name: Option<String>,
    pub port_name: Option<String>,
    pub stream_members: Vec<u32>,
    pub source_output_members: Vec<u32>,
    /// 0..NORM normalized volume limit; NORM (1.0) means unlimited.
    pub volume_limit: f64,
    pub corked: bool,
    pub muted_by_route: bool,
    pub locally_muted: bool,
    pub in_stream_count: u32,
    pub in_source_count: u32,
    pub moving_count: i64,
    pub property_overrides: HashMap<String, String>,
}

/// Normal (unattenuated) volume level.
pub const NORM: f64 = 1.0;

impl PolicyGroup {
    fn new(name: impl Into<String>, flags: GroupFlags) -> Self {
        Self {
            name: name.into(),
            flags,
            default_sink: None,
            default_source: None,
            preferred_sink_name: None,
            preferred_source_name: None,
            port_name: None,
            stream_members: Vec::new(),
            source_output_members: Vec::new(),
            volume_limit: NORM,
            corked: false,
            muted_by_route: false,
            locally_muted: false,
            in_stream_count: 0,
            in_source_count: 0,
            moving_count: 0,
            property_overrides: HashMap::new(),
        }
    }

    pub fn has(&self, f: GroupFlags) -> bool {
        self.flags.contains(f)
    }
}

/// Per-sink-input extension record (spec.md §3), owned by the engine and
/// keyed by the host's stream index. `ignore_next_state_change` is a
/// saturating counter, not a bool (SPEC_FULL.md §2.4): a single
/// engine-issued operation can trigger more than one state-change callback.
#[derive(Debug, Clone, Default)]
pub struct SinkInputExt {
    pub local_route: bool,
    pub local_mute: bool,
    pub corked_by_client: bool,
    pub ignore_next_state_change: u8,
}

impl SinkInputExt {
    pub fn arm_ignore(&mut self) {
        self.ignore_next_state_change = self.ignore_next_state_change.saturating_add(1);
    }

    /// Called when the host reports a cork/uncork state change. Returns
    /// true if this transition should update `corked_by_client` (i.e. it
    /// was not caused by the engine itself).
    pub fn observe_state_change(&mut self, corked: bool) -> bool {
        if self.ignore_next_state_change > 0 {
            self.ignore_next_state_change -= 1;
            false
        } else {
            self.corked_by_client = corked;
            true
        }
    }
}

/// A 64-bucket chaining hash table of policy groups, keyed by
/// `polynomial_hash(name) & 0x3F` (spec.md §3, invariant #3).
#[derive(Default)]
pub struct GroupTable {
    buckets: Vec<Vec<PolicyGroup>>,
}

impl GroupTable {
    pub fn new() -> Self {
        let mut t = Self {
            buckets: (0..HASH_BUCKETS as usize).map(|_| Vec::new()).collect(),
        };
        t.group_new(DEFAULT_GROUP, None, None, GroupFlags::empty());
        t
    }

    /// Create a group if absent (idempotent on `name`); returns the
    /// existing group on a repeat call (spec.md §4.3).
    pub fn group_new(&mut self, name: &str, sink_name: Option<String>, source_name: Option<String>, flags: GroupFlags) -> &mut PolicyGroup {
        let bucket = bucket_of(name);
        if self.buckets[bucket].iter().all(|g| g.name != name) {
            let mut g = PolicyGroup::new(name, flags);
            g.preferred_sink_name = sink_name;
            g.preferred_source_name = source_name;
            self.buckets[bucket].push(g);
        }
        self.buckets[bucket].iter_mut().find(|g| g.name == name).unwrap()
    }

    pub fn get(&self, name: &str) -> Option<&PolicyGroup> {
        self.buckets[bucket_of(name)].iter().find(|g| g.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PolicyGroup> {
        self.buckets[bucket_of(name)].iter_mut().find(|g| g.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyGroup> {
        self.buckets.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PolicyGroup> {
        self.buckets.iter_mut().flatten()
    }

    /// Bucket a name currently lives / would live in (hash invariant tests).
    pub fn bucket_of(name: &str) -> usize {
        bucket_of(name)
    }

    /// Free a group: non-default groups reassign their members to the
    /// default group; freeing the default releases its members to
    /// ungrouped state (spec.md §4.3).
    pub fn group_free(&mut self, name: &str) {
        if name == DEFAULT_GROUP {
            if let Some(g) = self.get_mut(DEFAULT_GROUP) {
                g.stream_members.clear();
                g.source_output_members.clear();
                g.in_stream_count = 0;
                g.in_source_count = 0;
            }
            return;
        }
        let bucket = bucket_of(name);
        let removed = {
            let list = &mut self.buckets[bucket];
            let idx = list.iter().position(|g| g.name == name);
            idx.map(|i| list.remove(i))
        };
        if let Some(removed) = removed {
            let default = self.group_new(DEFAULT_GROUP, None, None, GroupFlags::empty());
            for s in removed.stream_members {
                default.stream_members.push(s);
            }
            for s in removed.source_output_members {
                default.source_output_members.push(s);
            }
            default.in_stream_count += removed.in_stream_count;
            default.in_source_count += removed.in_source_count;
        }
    }

    /// Apply a newly-announced default sink to every group whose preferred
    /// sink is absent and whose current sink is unset (spec.md §4.3).
    pub fn apply_default_sink(&mut self, sink_index: u32) {
        for g in self.iter_mut() {
            if g.preferred_sink_name.is_none() && g.default_sink.is_none() {
                g.default_sink = Some(sink_index);
            }
        }
    }

    pub fn apply_default_source(&mut self, source_index: u32) {
        for g in self.iter_mut() {
            if g.preferred_source_name.is_none() && g.default_source.is_none() {
                g.default_source = Some(source_index);
            }
        }
    }

    /// A named sink a group prefers has been announced: bind regardless of
    /// default (spec.md §4.3).
    pub fn bind_preferred_sink(&mut self, sink_name: &str, sink_index: u32) {
        for g in self.iter_mut() {
            if g.preferred_sink_name.as_deref() == Some(sink_name) {
                g.default_sink = Some(sink_index);
            }
        }
    }

    pub fn bind_preferred_source(&mut self, source_name: &str, source_index: u32) {
        for g in self.iter_mut() {
            if g.preferred_source_name.as_deref() == Some(source_name) {
                g.default_source = Some(source_index);
            }
        }
    }

    /// Clear any group's binding to a sink/source that has just vanished.
    pub fn unbind_sink(&mut self, sink_index: u32) {
        for g in self.iter_mut() {
            if g.default_sink == Some(sink_index) {
                g.default_sink = None;
            }
        }
    }

    pub fn unbind_source(&mut self, source_index: u32) {
        for g in self.iter_mut() {
            if g.default_source == Some(source_index) {
                g.default_source = None;
            }
        }
    }

    /// Insert a sink-input into a group's membership list (the
    /// bookkeeping half of spec.md §4.3; routing/volume/cork side effects
    /// live in `routing.rs` since they need the `HostAdapter`). Returns the
    /// joined group's name and whether its in-stream-count just transitioned
    /// 0->1 (the `MEDIA_NOTIFY` "active" trigger).
    pub fn insert_sink_input(&mut self, group_name: Option<&str>, stream_index: u32) -> (String, bool) {
        let name = group_name.unwrap_or(DEFAULT_GROUP).to_string();
        let g = self.group_new(&name, None, None, GroupFlags::empty());
        if !g.stream_members.contains(&stream_index) {
            g.stream_members.push(stream_index);
        }
        let was_zero = g.in_stream_count == 0;
        g.in_stream_count += 1;
        if was_zero {
            debug!("group '{}' media became active", name);
        }
        (name, was_zero)
    }

    pub fn insert_source_output(&mut self, group_name: Option<&str>, index: u32) -> (String, bool) {
        let name = group_name.unwrap_or(DEFAULT_GROUP).to_string();
        let g = self.group_new(&name, None, None, GroupFlags::empty());
        if !g.source_output_members.contains(&index) {
            g.source_output_members.push(index);
        }
        let was_zero = g.in_source_count == 0;
        g.in_source_count += 1;
        (name, was_zero)
    }

    /// Remove a sink-input from its group; returns true if the group's
    /// in-stream-count transitioned to zero (caller emits media-inactive).
    pub fn remove_sink_input(&mut self, group_name: &str, stream_index: u32) -> bool {
        if let Some(g) = self.get_mut(group_name) {
            g.stream_members.retain(|&s| s != stream_index);
            if g.in_stream_count > 0 {
                g.in_stream_count -= 1;
            }
            return g.in_stream_count == 0;
        }
        false
    }

    /// Remove a source-output from its group; returns true if the group's
    /// in-source-count transitioned to zero.
    pub fn remove_source_output(&mut self, group_name: &str, index: u32) -> bool {
        if let Some(g) = self.get_mut(group_name) {
            g.source_output_members.retain(|&s| s != index);
            if g.in_source_count > 0 {
                g.in_source_count -= 1;
            }
            return g.in_source_count == 0;
        }
        false
    }

    /// Invariant #1/#2 checker: every stream index passed in belongs to
    /// exactly one group.
    #[cfg(test)]
    pub fn owning_group(&self, stream_index: u32) -> Vec<&str> {
        self.iter()
            .filter(|g| g.stream_members.contains(&stream_index))
            .map(|g| g.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_new_is_idempotent_on_name() {
        let mut t = GroupTable::new();
        t.group_new("music", None, None, GroupFlags::ROUTE_AUDIO);
        t.group_new("music", None, None, GroupFlags::CORK_STREAM);
        let g = t.get("music").unwrap();
        // Second call must not have overwritten the first group's flags.
        assert!(g.has(GroupFlags::ROUTE_AUDIO));
        assert!(!g.has(GroupFlags::CORK_STREAM));
    }

    #[test]
    fn default_group_exists_at_construction() {
        let t = GroupTable::new();
        assert!(t.get(DEFAULT_GROUP).is_some());
    }

    #[test]
    fn group_free_reassigns_members_to_default() {
        let mut t = GroupTable::new();
        t.group_new("music", None, None, GroupFlags::empty());
        t.insert_sink_input(Some("music"), 7);
        t.group_free("music");
        assert!(t.get("music").is_none());
        assert_eq!(t.owning_group(7), vec![DEFAULT_GROUP]);
    }

    #[test]
    fn freeing_default_group_clears_its_members() {
        let mut t = GroupTable::new();
        t.insert_sink_input(None, 1);
        t.group_free(DEFAULT_GROUP);
        assert!(t.owning_group(1).is_empty());
    }

    #[test]
    fn hash_invariant_holds_for_every_group() {
        let mut t = GroupTable::new();
        for name in ["music", "ring", "othermedia", "navigator", "phone-call"] {
            t.group_new(name, None, None, GroupFlags::empty());
        }
        for bucket_idx in 0..HASH_BUCKETS as usize {
            for g in &t.buckets[bucket_idx] {
                assert_eq!(GroupTable::bucket_of(&g.name), bucket_idx);
            }
        }
    }

    #[test]
    fn membership_totality_each_stream_in_exactly_one_group() {
        let mut t = GroupTable::new();
        t.group_new("music", None, None, GroupFlags::empty());
        t.insert_sink_input(Some("music"), 1);
        t.insert_sink_input(None, 2);
        assert_eq!(t.owning_group(1).len(), 1);
        assert_eq!(t.owning_group(2).len(), 1);
    }

    #[test]
    fn default_sink_propagates_only_when_group_has_no_preference() {
        let mut t = GroupTable::new();
        t.group_new("music", None, None, GroupFlags::empty());
        t.group_new("ring", Some("ihf".to_string()), None, GroupFlags::empty());
        t.apply_default_sink(3);
        assert_eq!(t.get("music").unwrap().default_sink, Some(3));
        assert_eq!(t.get("ring").unwrap().default_sink, None);
    }

    #[test]
    fn preferred_sink_binds_regardless_of_default() {
        let mut t = GroupTable::new();
        t.group_new("ring", Some("ihf".to_string()), None, GroupFlags::empty());
        t.bind_preferred_sink("ihf", 9);
        assert_eq!(t.get("ring").unwrap().default_sink, Some(9));
    }

    #[test]
    fn unbind_clears_binding_when_sink_disappears() {
        let mut t = GroupTable::new();
        t.group_new("music", None, None, GroupFlags::empty());
        t.apply_default_sink(5);
        t.unbind_sink(5);
        assert_eq!(t.get("music").unwrap().default_sink, None);
    }

    #[test]
    fn sink_input_ext_ignore_counter_suppresses_engine_issued_transitions() {
        let mut ext = SinkInputExt::default();
        ext.arm_ignore();
        ext.arm_ignore();
        assert!(!ext.observe_state_change(true));
        assert!(!ext.observe_state_change(false));
        assert!(ext.observe_state_change(true));
        assert!(ext.corked_by_client);
    }

    #[test]
    fn client_synonym_expands_to_route_and_cork() {
        assert_eq!(
            GroupFlags::client_synonym(),
            GroupFlags::ROUTE_AUDIO | GroupFlags::CORK_STREAM
        );
    }
}
