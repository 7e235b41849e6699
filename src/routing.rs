// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Routing & enforcement (component D): applying route/volume-limit/cork/
//! mute-by-route/local-mute decisions to group members.

use crate::classify::DeviceClass;
use crate::group::{GroupFlags, GroupTable, PolicyGroup, NORM};
use crate::host::{HostAdapter, ObjectKind};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by routing operations (spec.md §7: host operation
/// errors are logged and do not abort the overall move).
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("moving_count did not return to zero after route: group '{0}' left at {1}")]
    MovingCountNonZero(String, i64),
    #[error("no route target resolved for type '{0}'")]
    NoTarget(String),
}

/// The last-applied routing decision for one class (sink or source),
/// mirrored into the module's shared proplist (`policy.sink_route.*` /
/// `policy.source_route.*`) for the no-op optimization in spec.md §4.4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: String,
    pub mode: String,
    pub hwid: String,
}

/// Module-scoped shared properties (spec.md §9 "global default sink/
/// source ... move into the engine state"): last routing decisions and
/// any context-engine property broadcasts.
#[derive(Debug, Default)]
pub struct ModuleProps {
    pub sink_route: RouteDecision,
    pub source_route: RouteDecision,
    pub broadcast: HashMap<String, String>,
}

impl ModuleProps {
    pub fn route_for(&self, class: DeviceClass) -> &RouteDecision {
        match class {
            DeviceClass::Source => &self.source_route,
            _ => &self.sink_route,
        }
    }

    fn route_for_mut(&mut self, class: DeviceClass) -> &mut RouteDecision {
        match class {
            DeviceClass::Source => &mut self.source_route,
            _ => &mut self.sink_route,
        }
    }

    pub fn broadcast(&mut self, key: &str, value: &str) {
        self.broadcast.insert(key.to_string(), value.to_string());
    }
}

fn normalize_mode(mode: &str) -> String {
    if mode.is_empty() || mode == "na" {
        String::new()
    } else {
        mode.to_string()
    }
}

/// Move-to: route a group (or every `ROUTE_AUDIO` group if `group_name` is
/// `None`) onto a concrete target resolved from `target_type` (spec.md
/// §4.4). Returns the set of group names actually touched.
pub fn move_to(
    groups: &mut GroupTable,
    host: &mut dyn HostAdapter,
    module: &mut ModuleProps,
    classifier: &crate::classify::Classifier,
    group_name: Option<&str>,
    class: DeviceClass,
    target_type: &str,
    mode: &str,
    hwid: &str,
) -> Result<Vec<String>, RoutingError> {
    let kind = match class {
        DeviceClass::Sink => ObjectKind::Sink,
        DeviceClass::Source => ObjectKind::Source,
        DeviceClass::Card => ObjectKind::Card,
    };
    let target = host
        .resolve_target(kind, target_type)
        .ok_or_else(|| RoutingError::NoTarget(target_type.to_string()))?;

    let decision = RouteDecision {
        target: target_type.to_string(),
        mode: normalize_mode(mode),
        hwid: hwid.to_string(),
    };
    let unchanged = module.route_for(class) == &decision;

    let names: Vec<String> = match group_name {
        Some(n) => vec![n.to_string()],
        None => groups
            .iter()
            .filter(|g| g.has(GroupFlags::ROUTE_AUDIO))
            .map(|g| g.name.clone())
            .collect(),
    };

    if !unchanged {
        for name in &names {
            let members: Vec<u32> = groups
                .get(name)
                .map(|g| match class {
                    DeviceClass::Source => g.source_output_members.clone(),
                    _ => g.stream_members.clone(),
                })
                .unwrap_or_default();

            // Phase A: detach.
            let member_kind = match class {
                DeviceClass::Source => ObjectKind::SourceOutput,
                _ => ObjectKind::SinkInput,
            };
            let mut detached = Vec::new();
            if let Some(g) = groups.get_mut(name) {
                for &m in &members {
                    match host.start_move(member_kind, m) {
                        Ok(()) => {
                            g.moving_count += 1;
                            detached.push(m);
                        }
                        Err(e) => error!("start_move failed for {member_kind:?} {m}: {e}"),
                    }
                }
            }

            // Phase B: reconfigure (proplist broadcast + profile/port attempt).
            let rule = classifier.device_rules().iter().find(|r| r.class == class && r.type_label == target_type);
            if let Some(rule) = rule {
                if let Some(profile) = &rule.data.target_profile {
                    if let Some(card) = host.backing_card(kind, target) {
                        if let Err(e) = host.set_profile(card, profile) {
                            warn!("set_profile on route target's card failed: {e}");
                        }
                    }
                }
            }
            let port = rule
                .and_then(|r| host.get_property(kind, target, &r.property).and_then(|name| r.data.port_map.get(&name).cloned()))
                .unwrap_or_default();
            if let Err(e) = host.set_ports(kind, target, &port) {
                warn!("set_ports on route target failed: {e}");
            }

            // Phase C: attach.
            if let Some(g) = groups.get_mut(name) {
                for m in detached {
                    match host.finish_move(member_kind, m, target) {
                        Ok(()) => g.moving_count -= 1,
                        Err(e) => error!("finish_move failed for {member_kind:?} {m}: {e}"),
                    }
                }
            }
        }

        for name in &names {
            if let Some(g) = groups.get(name) {
                if g.moving_count != 0 {
                    error!(
                        "invariant violation: group '{}' moving_count={} after route",
                        name, g.moving_count
                    );
                    return Err(RoutingError::MovingCountNonZero(name.clone(), g.moving_count));
                }
            }
        }
    }

    // Step 4: always broadcast and fire the proplist-changed hook, even if
    // the route itself was a no-op.
    *module.route_for_mut(class) = decision.clone();
    module.broadcast("audio.mode", &normalize_mode(mode));
    module.broadcast("accessory.hwid", hwid);
    let route_prefix = match class {
        DeviceClass::Source => "policy.source_route",
        _ => "policy.sink_route",
    };
    let _ = host.set_property(kind, target, &format!("{route_prefix}.target"), target_type);
    let _ = host.set_property(kind, target, &format!("{route_prefix}.mode"), &decision.mode);
    let _ = host.set_property(kind, target, &format!("{route_prefix}.hwid"), hwid);

    Ok(names)
}

/// Per-channel volume factor so that `real_ratio[i] * factor[i] <= limit`
/// for every channel (spec.md §4.4 `set_group_limit`).
fn compute_factors(real_ratio: &[f64], limit: f64) -> Vec<f64> {
    real_ratio
        .iter()
        .map(|&r| if r > 0.0 { (limit / r).min(NORM) } else { NORM })
        .collect()
}

/// `set_group_limit`: apply a 0..100 percentage volume limit to a group's
/// members (spec.md §4.4).
pub fn set_group_limit(
    groups: &mut GroupTable,
    host: &mut dyn HostAdapter,
    name: &str,
    percent: u8,
    real_ratios: &HashMap<u32, Vec<f64>>,
) {
    let Some(g) = groups.get_mut(name) else {
        return;
    };
    if !g.has(GroupFlags::LIMIT_VOLUME) {
        return;
    }
    let limit = (percent as f64 / 100.0).clamp(0.0, NORM);
    g.volume_limit = limit;

    if g.has(GroupFlags::MUTE_BY_ROUTE) {
        if let Some(null_sink) = host.null_sink() {
            if percent == 0 {
                move_members_to_null_sink(g, host, null_sink);
                g.muted_by_route = true;
            } else if g.muted_by_route {
                move_members_back(g, host);
                g.muted_by_route = false;
                clamp_members(g, host, real_ratios, limit);
            } else {
                clamp_members(g, host, real_ratios, limit);
            }
            return;
        }
    }

    clamp_members(g, host, real_ratios, limit);
}

fn clamp_members(g: &PolicyGroup, host: &mut dyn HostAdapter, real_ratios: &HashMap<u32, Vec<f64>>, limit: f64) {
    for &stream in &g.stream_members {
        let ratios = real_ratios
            .get(&stream)
            .cloned()
            .unwrap_or_else(|| vec![NORM]);
        let factors = compute_factors(&ratios, limit);
        if host.uses_flat_volumes() {
            // Flat-volume hosts need a re-propagation signal rather than a
            // direct soft-volume push; modeled as a no-op marker property.
            let _ = host.set_property(ObjectKind::SinkInput, stream, "policy.needs_repropagate", "1");
        } else if let Err(e) = host.set_volume_factor(ObjectKind::SinkInput, stream, &factors) {
            warn!("set_volume_factor failed for stream {stream}: {e}");
        }
    }
}

/// Move a single freshly-inserted member onto `target`: a one-member version
/// of `move_to`'s detach/attach phases, used by stream insertion (spec.md
/// §4.3's `SET_SINK`/`MUTE_BY_ROUTE` branches) which moves just the new
/// member rather than a whole group.
pub fn move_new_member(host: &mut dyn HostAdapter, kind: ObjectKind, member: u32, target: u32) {
    if let Err(e) = host.start_move(kind, member) {
        error!("start_move failed for {kind:?} {member}: {e}");
        return;
    }
    if let Err(e) = host.finish_move(kind, member, target) {
        error!("finish_move failed for {kind:?} {member}: {e}");
    }
}

/// Apply a group's already-stored volume limit to one newly-inserted member
/// (spec.md §4.3 "else if LIMIT_VOLUME, clamp stream volume factor to
/// group's limit").
pub fn clamp_new_member(groups: &GroupTable, host: &mut dyn HostAdapter, group_name: &str, stream_index: u32, real_ratio: &[f64]) {
    let Some(g) = groups.get(group_name) else {
        return;
    };
    if !g.has(GroupFlags::LIMIT_VOLUME) {
        return;
    }
    let factors = compute_factors(real_ratio, g.volume_limit);
    if host.uses_flat_volumes() {
        let _ = host.set_property(ObjectKind::SinkInput, stream_index, "policy.needs_repropagate", "1");
    } else if let Err(e) = host.set_volume_factor(ObjectKind::SinkInput, stream_index, &factors) {
        warn!("set_volume_factor failed for stream {stream_index}: {e}");
    }
}

fn move_members_to_null_sink(g: &PolicyGroup, host: &mut dyn HostAdapter, null_sink: u32) {
    for &stream in &g.stream_members {
        if let Err(e) = host.start_move(ObjectKind::SinkInput, stream) {
            warn!("mute-by-route start_move failed for {stream}: {e}");
            continue;
        }
        if let Err(e) = host.finish_move(ObjectKind::SinkInput, stream, null_sink) {
            warn!("mute-by-route finish_move failed for {stream}: {e}");
        }
    }
}

fn move_members_back(g: &PolicyGroup, host: &mut dyn HostAdapter) {
    let Some(target) = g.default_sink else {
        return;
    };
    for &stream in &g.stream_members {
        if let Err(e) = host.start_move(ObjectKind::SinkInput, stream) {
            warn!("restore-from-mute start_move failed for {stream}: {e}");
            continue;
        }
        if let Err(e) = host.finish_move(ObjectKind::SinkInput, stream, target) {
            warn!("restore-from-mute finish_move failed for {stream}: {e}");
        }
    }
}

/// `cork_group`: cork/uncork every member, honoring `corked_by_client`
/// (spec.md §4.4, §9 "cork/uncork races"). Never uncorks a stream the user
/// paused; never re-corks a stream the user already paused.
pub fn cork_group(
    groups: &mut GroupTable,
    host: &mut dyn HostAdapter,
    exts: &mut HashMap<u32, crate::group::SinkInputExt>,
    name: &str,
    corked: bool,
) {
    let Some(g) = groups.get_mut(name) else {
        return;
    };
    if !g.has(GroupFlags::CORK_STREAM) || g.corked == corked {
        return;
    }
    g.corked = corked;
    for &stream in &g.stream_members {
        let ext = exts.entry(stream).or_default();
        if ext.corked_by_client {
            // The user paused this stream themselves: never uncork it out
            // from under them, and never re-cork a stream already paused.
            continue;
        }
        ext.arm_ignore();
        if let Err(e) = host.set_corked(stream, corked) {
            warn!("cork_group: set_corked failed for {stream}: {e}");
        }
    }
}

/// `mute_source`: set the mute bit on every source of a given
/// classification type (spec.md §4.4).
pub fn mute_source(classifier: &crate::classify::Classifier, host: &mut dyn HostAdapter, sources: &[(u32, crate::host::Proplist)], type_label: &str, muted: bool) {
    for (index, proplist) in sources {
        if classifier.is_object_typeof(DeviceClass::Source, proplist, type_label) {
            if let Err(e) = host.set_mute(ObjectKind::Source, *index, muted) {
                warn!("mute_source failed for source {index}: {e}");
            }
        }
    }
}

/// Local mute propagation (spec.md §4.4): when a `LOCAL_MUTE` stream joins
/// a group bound to sink `sink_index`, every other group currently bound
/// to that same sink is locally muted.
pub fn apply_local_mute(
    groups: &mut GroupTable,
    host: &mut dyn HostAdapter,
    exts: &HashMap<u32, crate::group::SinkInputExt>,
    marking_group: &str,
    sink_index: u32,
    null_sink: Option<u32>,
) {
    let others: Vec<String> = groups
        .iter()
        .filter(|g| g.name != marking_group && g.default_sink == Some(sink_index))
        .map(|g| g.name.clone())
        .collect();

    for name in others {
        let Some(g) = groups.get_mut(&name) else { continue };
        g.locally_muted = true;
        if g.has(GroupFlags::MUTE_BY_ROUTE) {
            if let Some(null_sink) = null_sink {
                move_members_to_null_sink(g, host, null_sink);
            }
        } else {
            for &stream in &g.stream_members {
                let _ = host.set_volume_factor(ObjectKind::SinkInput, stream, &[0.0, 0.0]);
                if exts.get(&stream).is_none() {
                    warn!("local mute: stream {stream} missing sink-input-ext record");
                }
            }
        }
    }
}

/// Restore groups previously locally-muted on behalf of `marking_group`
/// when that stream is removed (spec.md §4.4 "Removal of the marking
/// stream restores").
pub fn release_local_mute(groups: &mut GroupTable, host: &mut dyn HostAdapter, sink_index: u32) {
    let names: Vec<String> = groups
        .iter()
        .filter(|g| g.locally_muted && g.default_sink == Some(sink_index))
        .map(|g| g.name.clone())
        .collect();

    for name in names {
        let Some(g) = groups.get_mut(&name) else { continue };
        g.locally_muted = false;
        if g.has(GroupFlags::MUTE_BY_ROUTE) {
            if !g.muted_by_route {
                move_members_back(g, host);
            }
        } else {
            for &stream in &g.stream_members {
                let _ = host.set_volume_factor(ObjectKind::SinkInput, stream, &[g.volume_limit, g.volume_limit]);
            }
        }
    }
}
