// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The engine: wires the classifier, policy-group table, routing/
//! enforcement primitives, context/activity engine and object registry
//! into the single stream-insertion/removal/PDP-dispatch pipeline spec.md
//! §4.3 narrates as prose. Every other module in this crate is pure logic
//! plus a `HostAdapter` parameter; this is where their call order is
//! actually decided.

use crate::classify::{Classifier, DeviceClass, StreamLocalFlags};
use crate::config::ParsedConfig;
use crate::context::{ActivityVariable, ContextEngine, ContextRule, ContextVariable};
use crate::group::{GroupFlags, GroupTable, DEFAULT_GROUP, NORM};
use crate::host::{ClientContext, HostAdapter, NewStreamData, ObjectKind, Proplist, UserLookup};
use crate::pdp::DecodedBatch;
use crate::registry::{ObjectRegistry, SinkInputExtMap};
use crate::routing::{self, ModuleProps};
use std::collections::HashMap;
use tracing::warn;

/// An outward-facing notification the engine produced while processing one
/// event. The caller (the D-Bus layer in `main.rs`) turns these into the
/// `info(...)` signals spec.md §4.7 describes; the engine itself has no bus
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A group's in-stream-count transitioned across zero (`MEDIA_NOTIFY`).
    MediaStateChanged { group: String, active: bool },
}

/// Everything the engine owns between events: classifier/group/context
/// tables, the object registry, per-stream extension records, the last
/// classification context for each live stream (needed by `rediscover`),
/// and the module-scoped shared properties routing reads/writes.
pub struct Engine {
    classifier: Classifier,
    groups: GroupTable,
    context: ContextEngine,
    registry: ObjectRegistry,
    exts: SinkInputExtMap,
    module: ModuleProps,
    stream_contexts: HashMap<u32, (ClientContext, NewStreamData)>,
}

impl Engine {
    pub fn new() -> Self {
        let mut e = Self {
            classifier: Classifier::new(),
            groups: GroupTable::new(),
            context: ContextEngine::new(),
            registry: ObjectRegistry::new(),
            exts: SinkInputExtMap::new(),
            module: ModuleProps::default(),
            stream_contexts: HashMap::new(),
        };
        e.registry.collect_refs(&e.context);
        e
    }

    pub fn module_props(&self) -> &ModuleProps {
        &self.module
    }

    /// Install a freshly-loaded config into empty tables (startup path).
    pub fn install_config(&mut self, parsed: ParsedConfig) {
        install(&mut self.classifier, &mut self.groups, &mut self.context, parsed);
        self.registry.collect_refs(&self.context);
    }

    /// SIGHUP-equivalent reload (SPEC_FULL.md §2.6): rebuild the classifier
    /// and context tables from scratch, then re-run classification on every
    /// stream currently parked in the default group. Group membership and
    /// live stream bookkeeping are left untouched; only the rule tables are
    /// replaced, and `rediscover` reconciles membership against them.
    pub fn reload_config(&mut self, parsed: ParsedConfig, lookup: &dyn UserLookup) {
        self.classifier = Classifier::new();
        self.context = ContextEngine::new();
        install(&mut self.classifier, &mut self.groups, &mut self.context, parsed);
        self.registry.collect_refs(&self.context);
        self.registry.rediscover(&mut self.groups, &self.classifier, lookup, &self.stream_contexts);
    }

    /// `stream-new` (spec.md §4.2, §4.3): classify the stream, join its
    /// group, and apply the group's routing/cork/mute/volume policy to the
    /// newly-inserted member.
    pub fn on_stream_new(
        &mut self,
        host: &mut dyn HostAdapter,
        lookup: &dyn UserLookup,
        client: ClientContext,
        new_stream: NewStreamData,
        stream_index: u32,
    ) -> (String, Vec<EngineEvent>) {
        let (group_name, flags, local_route_port) = self.classifier.classify_stream(&client, &new_stream, DEFAULT_GROUP, lookup);
        let local_route = flags.contains(StreamLocalFlags::LOCAL_ROUTE);
        let local_mute = flags.contains(StreamLocalFlags::LOCAL_MUTE);
        let local_volmax = flags.contains(StreamLocalFlags::LOCAL_VOLMAX);

        let (joined, became_active) = self.groups.insert_sink_input(Some(&group_name), stream_index);
        self.exts.allocate(stream_index, local_route, local_mute);
        self.registry.note_stream_group(stream_index, &joined);
        self.stream_contexts.insert(stream_index, (client, new_stream));
        let _ = host.set_property(ObjectKind::SinkInput, stream_index, "policy.group", &joined);

        let Some(snapshot) = self.groups.get(&joined).map(GroupSnapshot::of) else {
            return (joined, Vec::new());
        };

        let mut events = Vec::new();
        if became_active && snapshot.flags.contains(GroupFlags::MEDIA_NOTIFY) {
            events.push(EngineEvent::MediaStateChanged {
                group: joined.clone(),
                active: true,
            });
        }

        if snapshot.flags.contains(GroupFlags::MUTE_BY_ROUTE) && snapshot.muted_by_route && !local_route {
            if let Some(null_sink) = host.null_sink() {
                routing::move_new_member(host, ObjectKind::SinkInput, stream_index, null_sink);
            }
        } else if snapshot.flags.intersects(GroupFlags::SET_SINK) {
            if let Some(target) = snapshot.default_sink {
                routing::move_new_member(host, ObjectKind::SinkInput, stream_index, target);
                if local_route {
                    let port = local_route_port.as_deref().or(snapshot.port_name.as_deref());
                    if let Some(port) = port {
                        if let Err(e) = host.set_ports(ObjectKind::Sink, target, port) {
                            warn!("stream insertion: local-route port override failed: {e}");
                        }
                    }
                }
            }
        }

        if snapshot.flags.contains(GroupFlags::CORK_STREAM) {
            let ext = self.exts.get_mut(stream_index).expect("just allocated above");
            if ext.corked_by_client != snapshot.corked {
                ext.arm_ignore();
                if let Err(e) = host.set_corked(stream_index, snapshot.corked) {
                    warn!("stream insertion: set_corked failed for {stream_index}: {e}");
                }
            }
        }

        if local_mute {
            if let Some(sink_index) = snapshot.default_sink {
                let null_sink = host.null_sink();
                routing::apply_local_mute(&mut self.groups, host, self.exts.all_mut(), &joined, sink_index, null_sink);
            }
        } else if snapshot.flags.contains(GroupFlags::LIMIT_VOLUME) {
            let ratio = if local_volmax { vec![NORM] } else { vec![NORM, NORM] };
            routing::clamp_new_member(&self.groups, host, &joined, stream_index, &ratio);
        }

        (joined, events)
    }

    /// `stream-remove` (spec.md §4.3 Removal): drop bookkeeping, and restore
    /// any local-mute the departing stream was holding over sibling groups.
    pub fn on_stream_removed(&mut self, host: &mut dyn HostAdapter, stream_index: u32) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let Some(group_name) = self.group_of_stream(stream_index) else {
            return events;
        };
        let was_local_mute = self.exts.get(stream_index).map(|e| e.local_mute).unwrap_or(false);
        let Some(group) = self.groups.get(&group_name) else {
            return events;
        };
        let default_sink = group.default_sink;
        let media_notify = group.has(GroupFlags::MEDIA_NOTIFY);

        let became_inactive = self.groups.remove_sink_input(&group_name, stream_index);
        self.exts.destroy(stream_index);
        self.registry.forget_stream(stream_index);
        self.stream_contexts.remove(&stream_index);

        if became_inactive && media_notify {
            events.push(EngineEvent::MediaStateChanged {
                group: group_name,
                active: false,
            });
        }
        if was_local_mute {
            if let Some(sink_index) = default_sink {
                routing::release_local_mute(&mut self.groups, host, sink_index);
            }
        }
        events
    }

    pub fn on_source_output_new(&mut self, host: &mut dyn HostAdapter, lookup: &dyn UserLookup, client: ClientContext, new_stream: NewStreamData, index: u32) -> String {
        let (group_name, _flags, _port) = self.classifier.classify_stream(&client, &new_stream, DEFAULT_GROUP, lookup);
        let (joined, _became_active) = self.groups.insert_source_output(Some(&group_name), index);
        let _ = host.set_property(ObjectKind::SourceOutput, index, "policy.group", &joined);
        joined
    }

    pub fn on_source_output_removed(&mut self, group_name: &str, index: u32) {
        self.groups.remove_source_output(group_name, index);
    }

    fn group_of_stream(&self, stream_index: u32) -> Option<String> {
        self.groups
            .iter()
            .find(|g| g.stream_members.contains(&stream_index))
            .map(|g| g.name.clone())
    }

    /// `move_to` entry point, driven by an `audio_route` PDP action.
    pub fn route(&mut self, host: &mut dyn HostAdapter, group_name: Option<&str>, class: DeviceClass, target_type: &str, mode: &str, hwid: &str) -> bool {
        match routing::move_to(&mut self.groups, host, &mut self.module, &self.classifier, group_name, class, target_type, mode, hwid) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("route failed: {e}");
                false
            }
        }
    }

    pub fn set_group_limit(&mut self, host: &mut dyn HostAdapter, name: &str, percent: u8, real_ratios: &HashMap<u32, Vec<f64>>) {
        routing::set_group_limit(&mut self.groups, host, name, percent, real_ratios);
    }

    pub fn cork_group(&mut self, host: &mut dyn HostAdapter, name: &str, corked: bool) {
        routing::cork_group(&mut self.groups, host, self.exts.all_mut(), name, corked);
    }

    pub fn mute_source(&mut self, host: &mut dyn HostAdapter, sources: &[(u32, Proplist)], type_label: &str, muted: bool) {
        routing::mute_source(&self.classifier, host, sources, type_label, muted);
    }

    pub fn on_variable_change(&mut self, host: &mut dyn HostAdapter, name: &str, value: &str) -> bool {
        let queued_ok = self.context.on_variable_change(name, value).is_ok();
        self.context.commit_pending(host, &mut self.module);
        queued_ok
    }

    /// Dispatch one decoded `audio_actions` batch (spec.md §6): device
    /// moves run first, then volume/cork/mute, then every context action is
    /// enqueued and committed once. Returns the batch-level ack.
    pub fn dispatch_batch(&mut self, host: &mut dyn HostAdapter, real_ratios: &HashMap<u32, Vec<f64>>, batch: &DecodedBatch) -> bool {
        let mut ok = true;
        for r in &batch.routes {
            let class = match r.class {
                policy_ipc::RouteClass::Sink => DeviceClass::Sink,
                policy_ipc::RouteClass::Source => DeviceClass::Source,
            };
            if !self.route(host, None, class, &r.device, &r.mode, &r.hwid) {
                ok = false;
            }
        }
        for v in &batch.volume_limits {
            self.set_group_limit(host, &v.group, v.limit.clamp(0, 100) as u8, real_ratios);
        }
        for c in &batch.corks {
            self.cork_group(host, &c.group, c.corked);
        }
        if !batch.mutes.is_empty() {
            let sources = host.list_objects(ObjectKind::Source);
            for m in &batch.mutes {
                self.mute_source(host, &sources, &m.device, m.muted);
            }
        }
        for ctx in &batch.context_sets {
            if self.context.on_variable_change(&ctx.variable, &ctx.value).is_err() {
                ok = false;
            }
        }
        self.context.commit_pending(host, &mut self.module);
        ok
    }

    pub fn register_pid_override(&mut self, over: crate::classify::PidOverride) {
        self.classifier.add_pid_override(over);
    }

    pub fn unregister_pid_override(&mut self, pid: u32, stream_name: Option<&str>, property: &str, match_expr: &crate::match_expr::MatchExpr) {
        self.classifier.remove_pid_override(pid, stream_name, property, match_expr);
    }

    /// Host lifecycle hook: a module/card/sink/source/sink-input/source-
    /// output appeared (NEW) or had its name re-announced (PUT).
    pub fn on_object_new(&mut self, kind: ObjectKind, name: &str, index: u32) {
        self.registry.on_new(kind, name, index);
    }

    /// Host lifecycle hook: an object vanished (UNLINK).
    pub fn on_object_unlink(&mut self, host: &mut dyn HostAdapter, kind: ObjectKind, index: u32) {
        self.registry.on_unlink(kind, index);
        match kind {
            ObjectKind::Sink => {
                self.groups.unbind_sink(index);
                routing::release_local_mute(&mut self.groups, host, index);
            }
            ObjectKind::Source => self.groups.unbind_source(index),
            _ => {}
        }
    }

    pub fn on_default_sink_changed(&mut self, sink_index: u32) {
        self.groups.apply_default_sink(sink_index);
    }

    pub fn on_default_source_changed(&mut self, source_index: u32) {
        self.groups.apply_default_source(source_index);
    }

    pub fn on_preferred_sink_bound(&mut self, sink_name: &str, sink_index: u32) {
        self.groups.bind_preferred_sink(sink_name, sink_index);
    }

    pub fn on_preferred_source_bound(&mut self, source_name: &str, source_index: u32) {
        self.groups.bind_preferred_source(source_name, source_index);
    }

    pub fn on_device_changed(&mut self, host: &mut dyn HostAdapter, device_name: &str) {
        crate::context::device_changed(&mut self.context, device_name, host, &mut self.module);
    }

    pub fn on_sink_state_changed(&mut self, host: &mut dyn HostAdapter, sink_name: &str, opened: bool) {
        crate::context::sink_state_changed(&mut self.context, sink_name, opened, host, &mut self.module);
    }

    pub fn classify_device(&self, class: DeviceClass, proplist: &Proplist, flag_mask: u32, flag_value: u32, max_len: usize) -> String {
        self.classifier.classify_device(class, proplist, flag_mask, flag_value, max_len)
    }
}

/// A cheap, owned snapshot of the fields `on_stream_new` needs to decide
/// enforcement, taken so the group table isn't held borrowed across the
/// subsequent host calls (several of which also need `&mut self.groups`).
struct GroupSnapshot {
    flags: GroupFlags,
    default_sink: Option<u32>,
    port_name: Option<String>,
    corked: bool,
    muted_by_route: bool,
}

impl GroupSnapshot {
    fn of(g: &crate::group::PolicyGroup) -> Self {
        Self {
            flags: g.flags,
            default_sink: g.default_sink,
            port_name: g.port_name.clone(),
            corked: g.corked,
            muted_by_route: g.muted_by_route,
        }
    }
}

/// Shared by `install_config` and `reload_config`: populate the classifier,
/// group, and context/activity tables from a parsed config.
fn install(classifier: &mut Classifier, groups: &mut GroupTable, context: &mut ContextEngine, parsed: ParsedConfig) {
    for g in parsed.groups {
        let group = groups.group_new(&g.name, g.sink, g.source, g.flags);
        group.property_overrides = g.properties;
    }
    for d in parsed.devices {
        classifier.add_device_rule(d.class, d.type_label, d.property, d.match_expr, d.data);
    }
    for s in parsed.streams {
        classifier.add_stream_rule(s.0);
    }
    for p in parsed.pid_overrides {
        classifier.add_pid_override(p);
    }

    let mut by_variable: HashMap<String, Vec<ContextRule>> = HashMap::new();
    for cr in parsed.context_rules {
        by_variable.entry(cr.variable).or_default().push(cr.rule);
    }
    for (name, rules) in by_variable {
        let mut var = ContextVariable::new(name);
        var.rules = rules;
        context.add_variable(var);
    }

    // Each `[activity]` section produces its own ActivityVariable with one
    // active/inactive rule pair; sections sharing a device name merge into
    // the one runtime variable that device drives (spec.md §4.5).
    let mut activities: HashMap<String, ActivityVariable> = HashMap::new();
    for a in parsed.activities {
        let incoming = a.variable;
        match activities.get_mut(&incoming.device_name) {
            Some(existing) => {
                let ActivityVariable {
                    active_rules,
                    inactive_rules,
                    default_state_actions,
                    ..
                } = incoming;
                existing.active_rules.extend(active_rules);
                existing.inactive_rules.extend(inactive_rules);
                existing.default_state_actions.extend(default_state_actions);
            }
            None => {
                activities.insert(incoming.device_name.clone(), incoming);
            }
        }
    }
    for (_, var) in activities {
        context.add_activity(var);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigManager, GroupSpec};
    use crate::host::test_support::RecordingHost;
    use crate::host::NoUserLookup;

    fn proplist_with(name: &str) -> Proplist {
        let mut p = Proplist::new();
        p.insert("media.name".to_string(), name.to_string());
        p
    }

    #[test]
    fn stream_insertion_joins_named_group_and_tags_proplist() {
        let mut engine = Engine::new();
        engine.groups.group_new("music", None, None, GroupFlags::MEDIA_NOTIFY);
        engine.classifier.add_stream_rule(crate::classify::StreamRule {
            property: "name".to_string(),
            match_expr: crate::match_expr::MatchExpr::Equals("song".to_string()),
            clnam: None,
            uid: None,
            exe: None,
            stnam: None,
            active_sink: None,
            group_name: "music".to_string(),
            flags: StreamLocalFlags::empty(),
            local_route_port: None,
        });
        let mut host = RecordingHost::default();
        let new_stream = NewStreamData {
            proplist: proplist_with("song"),
            stream_name: Some("song".to_string()),
            active_sink: None,
        };
        let (group, events) = engine.on_stream_new(&mut host, &NoUserLookup, ClientContext::default(), new_stream, 1);
        assert_eq!(group, "music");
        assert_eq!(
            events,
            vec![EngineEvent::MediaStateChanged {
                group: "music".to_string(),
                active: true
            }]
        );
        assert_eq!(host.get_property(ObjectKind::SinkInput, 1, "policy.group"), Some("music".to_string()));
    }

    #[test]
    fn set_sink_group_moves_new_member_to_default_sink() {
        let mut engine = Engine::new();
        engine.groups.group_new("music", None, None, GroupFlags::SET_SINK);
        engine.groups.get_mut("music").unwrap().default_sink = Some(7);
        let mut host = RecordingHost::default();
        let new_stream = NewStreamData {
            proplist: proplist_with("x"),
            stream_name: Some("x".to_string()),
            active_sink: None,
        };
        engine.classifier.add_stream_rule(crate::classify::StreamRule {
            property: "name".to_string(),
            match_expr: crate::match_expr::MatchExpr::True,
            clnam: None,
            uid: None,
            exe: None,
            stnam: None,
            active_sink: None,
            group_name: "music".to_string(),
            flags: StreamLocalFlags::empty(),
            local_route_port: None,
        });
        engine.on_stream_new(&mut host, &NoUserLookup, ClientContext::default(), new_stream, 3);
        assert!(host
            .calls
            .iter()
            .any(|c| matches!(c, crate::host::test_support::Call::FinishMove(ObjectKind::SinkInput, 3, 7))));
    }

    #[test]
    fn removing_the_last_member_reports_media_inactive() {
        let mut engine = Engine::new();
        engine.groups.get_mut(DEFAULT_GROUP).unwrap().flags = GroupFlags::MEDIA_NOTIFY;
        let mut host = RecordingHost::default();
        let new_stream = NewStreamData::default();
        engine.on_stream_new(&mut host, &NoUserLookup, ClientContext::default(), new_stream, 9);
        let events = engine.on_stream_removed(&mut host, 9);
        assert_eq!(
            events,
            vec![EngineEvent::MediaStateChanged {
                group: DEFAULT_GROUP.to_string(),
                active: false
            }]
        );
    }

    #[test]
    fn media_state_events_are_suppressed_without_media_notify() {
        let mut engine = Engine::new();
        let mut host = RecordingHost::default();
        let new_stream = NewStreamData::default();
        // DEFAULT_GROUP carries no MEDIA_NOTIFY flag, so neither insertion
        // nor removal should produce an EngineEvent.
        let (_, insert_events) = engine.on_stream_new(&mut host, &NoUserLookup, ClientContext::default(), new_stream, 11);
        assert!(insert_events.is_empty());
        let remove_events = engine.on_stream_removed(&mut host, 11);
        assert!(remove_events.is_empty());
    }

    #[test]
    fn install_config_populates_group_table_from_parsed_spec() {
        let mut parsed = ParsedConfig::default();
        parsed.groups.push(GroupSpec {
            name: "ring".to_string(),
            sink: None,
            source: None,
            properties: HashMap::new(),
            flags: GroupFlags::ROUTE_AUDIO,
        });
        let mut engine = Engine::new();
        engine.install_config(parsed);
        assert!(engine.groups.get("ring").unwrap().has(GroupFlags::ROUTE_AUDIO));
    }

    #[test]
    fn reload_config_rediscovers_default_group_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.conf");
        std::fs::write(&path, "[group]\nname=ring\n[stream]\nname=alert\ngroup=ring\n").unwrap();
        let manager = ConfigManager::new(path, None);
        let parsed = manager.load().unwrap();

        let mut engine = Engine::new();
        let mut host = RecordingHost::default();
        let new_stream = NewStreamData {
            proplist: proplist_with("alert"),
            stream_name: Some("alert".to_string()),
            active_sink: None,
        };
        engine.on_stream_new(&mut host, &NoUserLookup, ClientContext::default(), new_stream, 5);
        assert_eq!(engine.group_of_stream(5), Some(DEFAULT_GROUP.to_string()));

        engine.reload_config(parsed, &NoUserLookup);
        assert_eq!(engine.group_of_stream(5), Some("ring".to_string()));
    }

    #[test]
    fn dispatch_batch_applies_cork_and_context_actions() {
        let mut engine = Engine::new();
        engine.groups.group_new("music", None, None, GroupFlags::CORK_STREAM);
        engine.groups.insert_sink_input(Some("music"), 1);
        let mut host = RecordingHost::default();
        let batch = DecodedBatch {
            routes: vec![],
            volume_limits: vec![],
            corks: vec![policy_ipc::AudioCorkAction {
                group: "music".to_string(),
                corked: true,
            }],
            mutes: vec![],
            context_sets: vec![],
        };
        let ok = engine.dispatch_batch(&mut host, &HashMap::new(), &batch);
        assert!(ok);
        assert!(host
            .calls
            .iter()
            .any(|c| matches!(c, crate::host::test_support::Call::SetCorked(1, true))));
    }

    #[test]
    fn unknown_route_target_fails_the_batch_ack() {
        let mut engine = Engine::new();
        let mut host = RecordingHost::default();
        let batch = DecodedBatch {
            routes: vec![policy_ipc::AudioRouteAction {
                class: policy_ipc::RouteClass::Sink,
                device: "nonexistent".to_string(),
                mode: "na".to_string(),
                hwid: String::new(),
            }],
            volume_limits: vec![],
            corks: vec![],
            mutes: vec![],
            context_sets: vec![],
        };
        assert!(!engine.dispatch_batch(&mut host, &HashMap::new(), &batch));
    }
}
