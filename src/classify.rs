// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Classifier tables (component B): pattern-matched mapping from
//! audio-server objects onto symbolic types and policy groups.

use crate::host::{get_property, ClientContext, NewStreamData, Proplist, UserLookup};
use crate::match_expr::MatchExpr;
use bitflags::bitflags;
use tracing::warn;

bitflags! {
    /// Per-stream flags recorded at classification time (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamLocalFlags: u32 {
        /// Stream carries its own port override, bypassing the group's port.
        const LOCAL_ROUTE  = 0b001;
        /// Muting this stream also locally-mutes its group peers sharing a sink.
        const LOCAL_MUTE   = 0b010;
        /// Stream clamps its own volume to NORM at creation.
        const LOCAL_VOLMAX = 0b100;
    }
}

/// A `uid=` match on a stream rule: either a bare numeric uid or a user
/// name resolved through [`UserLookup`] (SPEC_FULL.md §2.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidMatch {
    Numeric(u32),
    Name(String),
}

impl UidMatch {
    fn matches(&self, uid: Option<u32>, lookup: &dyn UserLookup) -> bool {
        match self {
            UidMatch::Numeric(want) => uid == Some(*want),
            UidMatch::Name(name) => match uid {
                Some(uid) => lookup.resolve_uid(name) == Some(uid),
                None => false,
            },
        }
    }
}

/// A stream classifier rule (spec.md §3).
#[derive(Debug, Clone)]
pub struct StreamRule {
    pub property: String,
    pub match_expr: MatchExpr,
    pub clnam: Option<String>,
    pub uid: Option<UidMatch>,
    pub exe: Option<String>,
    pub stnam: Option<String>,
    pub active_sink: Option<String>,
    pub group_name: String,
    pub flags: StreamLocalFlags,
    pub local_route_port: Option<String>,
}

/// A pid-scoped override (spec.md §3).
#[derive(Debug, Clone)]
pub struct PidOverride {
    pub pid: u32,
    pub stream_name: Option<String>,
    pub property: String,
    pub match_expr: MatchExpr,
    pub group_name: String,
}

/// Which host object a device/card rule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Sink,
    Source,
    Card,
}

/// The non-match part of a device/card rule's payload (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct DeviceRuleData {
    pub flags: u32,
    pub target_profile: Option<crate::host::Profile>,
    /// sink-name -> port-name, used by move-to Phase B.
    pub port_map: std::collections::HashMap<String, String>,
}

/// A device or card classifier rule (spec.md §3).
#[derive(Debug, Clone)]
pub struct DeviceRule {
    pub class: DeviceClass,
    pub type_label: String,
    pub property: String,
    pub match_expr: MatchExpr,
    pub data: DeviceRuleData,
}

const PID_BUCKETS: usize = 64;

/// The full classifier: stream/device/card rule tables and the pid-override
/// hash (spec.md §4.2).
#[derive(Default)]
pub struct Classifier {
    stream_rules: Vec<StreamRule>,
    device_rules: Vec<DeviceRule>,
    pid_overrides: Vec<Vec<PidOverride>>,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            stream_rules: Vec::new(),
            device_rules: Vec::new(),
            pid_overrides: (0..PID_BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    fn pid_bucket(pid: u32) -> usize {
        (pid as usize) % PID_BUCKETS
    }

    pub fn add_stream_rule(&mut self, rule: StreamRule) {
        self.stream_rules.push(rule);
    }

    pub fn add_device_rule(&mut self, class: DeviceClass, type_label: impl Into<String>, property: impl Into<String>, match_expr: MatchExpr, data: DeviceRuleData) {
        self.device_rules.push(DeviceRule {
            class,
            type_label: type_label.into(),
            property: property.into(),
            match_expr,
            data,
        });
    }

    pub fn add_pid_override(&mut self, over: PidOverride) {
        let bucket = Self::pid_bucket(over.pid);
        // One pid may have multiple stream-name-qualified entries.
        self.pid_overrides[bucket].push(over);
    }

    pub fn remove_pid_override(&mut self, pid: u32, stream_name: Option<&str>, property: &str, match_expr: &MatchExpr) {
        let bucket = Self::pid_bucket(pid);
        self.pid_overrides[bucket].retain(|o| {
            !(o.pid == pid
                && o.stream_name.as_deref() == stream_name
                && o.property == property
                && o.match_expr == *match_expr)
        });
    }

    /// Bucket index a pid override with the given pid currently lives in;
    /// exposed for the pid-hash-invariant test (spec.md §8 #4).
    pub fn pid_bucket_of(&self, pid: u32) -> usize {
        Self::pid_bucket(pid)
    }

    fn lookup_pid_override(&self, pid: u32, stream_name: Option<&str>, proplist: &Proplist, lookup: &dyn UserLookup) -> Option<&PidOverride> {
        let _ = lookup;
        let bucket = &self.pid_overrides[Self::pid_bucket(pid)];
        bucket.iter().find(|o| {
            o.pid == pid
                && (o.stream_name.as_deref() == stream_name || (o.stream_name.is_none() && stream_name.is_none()))
                && o.match_expr.matches(&get_property(proplist, &o.property))
        })
    }

    /// Classify an incoming stream (spec.md §4.2). Returns the group name,
    /// local flags, and (if the matched rule carried one) the port the
    /// stream's `LOCAL_ROUTE` override should pin its group's sink to.
    pub fn classify_stream(
        &self,
        client: &ClientContext,
        new_stream: &NewStreamData,
        default_group: &str,
        lookup: &dyn UserLookup,
    ) -> (String, StreamLocalFlags, Option<String>) {
        if let Some(pid) = client.pid {
            if let Some(over) = self.lookup_pid_override(pid, new_stream.stream_name.as_deref(), &new_stream.proplist, lookup) {
                return (over.group_name.clone(), StreamLocalFlags::empty(), None);
            }
        }

        for rule in &self.stream_rules {
            if let Some(uid) = &rule.uid {
                if !uid.matches(client.uid, lookup) {
                    continue;
                }
            }
            if let Some(clnam) = &rule.clnam {
                if client.name.as_deref() != Some(clnam.as_str()) {
                    continue;
                }
            }
            if let Some(exe) = &rule.exe {
                if client.exe.as_deref() != Some(exe.as_str()) {
                    continue;
                }
            }
            if let Some(active_sink) = &rule.active_sink {
                if new_stream.active_sink.as_deref() != Some(active_sink.as_str()) {
                    continue;
                }
            }
            if let Some(stnam) = &rule.stnam {
                if new_stream.stream_name.as_deref() != Some(stnam.as_str()) {
                    continue;
                }
            }
            let value = get_property(&new_stream.proplist, &rule.property);
            if rule.match_expr.matches(&value) {
                return (rule.group_name.clone(), rule.flags, rule.local_route_port.clone());
            }
        }

        (default_group.to_string(), StreamLocalFlags::empty(), None)
    }

    /// Classify a device or card object additively (spec.md §4.2): every
    /// rule whose flags match `flag_mask`/`flag_value` and whose property
    /// matches contributes its type label, space-joined, bounded to
    /// `max_len` bytes. On overflow the buffer is emptied and a warning
    /// logged (invariant #10).
    pub fn classify_device(&self, class: DeviceClass, proplist: &Proplist, flag_mask: u32, flag_value: u32, max_len: usize) -> String {
        let mut out = String::new();
        for rule in self.device_rules.iter().filter(|r| r.class == class) {
            if rule.data.flags & flag_mask != flag_value {
                continue;
            }
            let value = get_property(proplist, &rule.property);
            if !rule.match_expr.matches(&value) {
                continue;
            }
            let extra_len = rule.type_label.len() + if out.is_empty() { 0 } else { 1 };
            if out.len() + extra_len > max_len {
                warn!(
                    "classify_device: type list overflowed {} byte buffer, clearing",
                    max_len
                );
                return String::new();
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&rule.type_label);
        }
        out
    }

    /// True iff some rule of `type_label` has a property value that matches
    /// on `obj` (spec.md §4.2 `is_object_typeof`).
    pub fn is_object_typeof(&self, class: DeviceClass, proplist: &Proplist, type_label: &str) -> bool {
        self.device_rules
            .iter()
            .filter(|r| r.class == class && r.type_label == type_label)
            .any(|r| r.match_expr.matches(&get_property(proplist, &r.property)))
    }

    pub fn device_rules(&self) -> &[DeviceRule] {
        &self.device_rules
    }

    /// The payload of the first device/card rule of `class` tagged with
    /// `type_label`, used by move-to Phase B to look up a route target's
    /// profile/port data (spec.md §4.4).
    pub fn device_rule_data(&self, class: DeviceClass, type_label: &str) -> Option<&DeviceRuleData> {
        self.device_rules
            .iter()
            .find(|r| r.class == class && r.type_label == type_label)
            .map(|r| &r.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoUserLookup;

    fn ctx(pid: Option<u32>) -> ClientContext {
        ClientContext {
            pid,
            ..Default::default()
        }
    }

    fn stream_with_name(name: &str) -> NewStreamData {
        let mut p = Proplist::new();
        p.insert("media.name".to_string(), name.to_string());
        NewStreamData {
            proplist: p,
            stream_name: Some(name.to_string()),
            active_sink: None,
        }
    }

    #[test]
    fn s1_pid_override_classifies_incoming_stream() {
        let mut c = Classifier::new();
        c.add_pid_override(PidOverride {
            pid: 1234,
            stream_name: Some("alert".to_string()),
            property: "name".to_string(),
            match_expr: MatchExpr::Equals("alert".to_string()),
            group_name: "ring".to_string(),
        });
        let (group, flags, port) = c.classify_stream(&ctx(Some(1234)), &stream_with_name("alert"), "othermedia", &NoUserLookup);
        assert_eq!(group, "ring");
        assert_eq!(flags, StreamLocalFlags::empty());
        assert_eq!(port, None);
    }

    #[test]
    fn unmatched_stream_falls_back_to_default_group() {
        let c = Classifier::new();
        let (group, _, _) = c.classify_stream(&ctx(None), &stream_with_name("random"), "othermedia", &NoUserLookup);
        assert_eq!(group, "othermedia");
    }

    #[test]
    fn first_matching_stream_rule_wins() {
        let mut c = Classifier::new();
        c.add_stream_rule(StreamRule {
            property: "name".to_string(),
            match_expr: MatchExpr::True,
            clnam: None,
            uid: None,
            exe: None,
            stnam: None,
            active_sink: None,
            group_name: "first".to_string(),
            flags: StreamLocalFlags::empty(),
            local_route_port: None,
        });
        c.add_stream_rule(StreamRule {
            property: "name".to_string(),
            match_expr: MatchExpr::True,
            clnam: None,
            uid: None,
            exe: None,
            stnam: None,
            active_sink: None,
            group_name: "second".to_string(),
            flags: StreamLocalFlags::empty(),
            local_route_port: None,
        });
        let (group, _, _) = c.classify_stream(&ctx(None), &stream_with_name("x"), "othermedia", &NoUserLookup);
        assert_eq!(group, "first");
    }

    #[test]
    fn pid_bucket_invariant_holds() {
        let c = Classifier::new();
        for pid in [0u32, 1, 63, 64, 65, 128, 12345] {
            assert_eq!(c.pid_bucket_of(pid), (pid % 64) as usize);
        }
    }

    #[test]
    fn device_classification_is_additive_and_space_joined() {
        let mut c = Classifier::new();
        c.add_device_rule(
            DeviceClass::Sink,
            "ihf",
            "device.string",
            MatchExpr::Equals("alsa_output.ihf".to_string()),
            DeviceRuleData::default(),
        );
        c.add_device_rule(
            DeviceClass::Sink,
            "builtin",
            "device.string",
            MatchExpr::Equals("alsa_output.ihf".to_string()),
            DeviceRuleData::default(),
        );
        let mut p = Proplist::new();
        p.insert("device.string".to_string(), "alsa_output.ihf".to_string());
        let types = c.classify_device(DeviceClass::Sink, &p, 0, 0, 64);
        assert_eq!(types, "ihf builtin");
    }

    #[test]
    fn device_classification_overflow_empties_buffer() {
        let mut c = Classifier::new();
        c.add_device_rule(
            DeviceClass::Sink,
            "averylongtypelabelthatoverflows",
            "device.string",
            MatchExpr::True,
            DeviceRuleData::default(),
        );
        let p = Proplist::new();
        let types = c.classify_device(DeviceClass::Sink, &p, 0, 0, 4);
        assert_eq!(types, "");
    }

    #[test]
    fn is_object_typeof_checks_named_type() {
        let mut c = Classifier::new();
        c.add_device_rule(
            DeviceClass::Sink,
            "ihf",
            "device.string",
            MatchExpr::Equals("alsa_output.ihf".to_string()),
            DeviceRuleData::default(),
        );
        let mut p = Proplist::new();
        p.insert("device.string".to_string(), "alsa_output.ihf".to_string());
        assert!(c.is_object_typeof(DeviceClass::Sink, &p, "ihf"));
        assert!(!c.is_object_typeof(DeviceClass::Sink, &p, "bt"));
    }

    #[test]
    fn uid_name_match_resolves_through_user_lookup() {
        struct Lookup;
        impl UserLookup for Lookup {
            fn resolve_uid(&self, name: &str) -> Option<u32> {
                if name == "phone" {
                    Some(42)
                } else {
                    None
                }
            }
        }
        let mut c = Classifier::new();
        c.add_stream_rule(StreamRule {
            property: "name".to_string(),
            match_expr: MatchExpr::True,
            clnam: None,
            uid: Some(UidMatch::Name("phone".to_string())),
            exe: None,
            stnam: None,
            active_sink: None,
            group_name: "phone-group".to_string(),
            flags: StreamLocalFlags::empty(),
            local_route_port: None,
        });
        let client = ClientContext {
            uid: Some(42),
            ..Default::default()
        };
        let (group, _, _) = c.classify_stream(&client, &stream_with_name("x"), "othermedia", &Lookup);
        assert_eq!(group, "phone-group");
    }
}
