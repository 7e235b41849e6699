// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Config loader (component I): the declarative format that populates the
//! classifier, group table, and context/activity engine.

mod parser;

use crate::classify::{DeviceClass, DeviceRuleData, PidOverride, StreamRule, UidMatch};
use crate::context::{Action, ActivityRule, ActivityVariable, ContextRule, ObjectRef, ValueSource};
use crate::group::GroupFlags;
use crate::host::{ObjectKind, Profile};
use crate::match_expr::{MatchError, MatchExpr};
use parser::Line;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading '{path}': {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("{path}:{line}: {reason}")]
    ParseAt { path: PathBuf, line: usize, reason: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("unknown flag synonym '{0}'")]
    UnknownFlag(String),
    #[error("unknown object-ref kind '{0}'")]
    UnknownObjectKind(String),
    #[error("bad match expression: {0}")]
    BadMatch(#[from] MatchError),
    #[error("no rules were loaded from any config file")]
    NoRulesLoaded,
}

/// A group declaration as read from `[group]` (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub sink: Option<String>,
    pub source: Option<String>,
    pub properties: HashMap<String, String>,
    pub flags: GroupFlags,
}

/// A device or card declaration as read from `[device]`/`[card]`.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub class: DeviceClass,
    pub type_label: String,
    pub property: String,
    pub match_expr: MatchExpr,
    pub data: DeviceRuleData,
}

/// A stream classifier rule as read from `[stream]`.
pub struct StreamSpec(pub StreamRule);

/// An object-ref as read from any OBJECTREF-valued key.
#[derive(Clone)]
pub struct ObjectRefSpec {
    pub kind: ObjectKind,
    pub match_expr: MatchExpr,
}

/// A `[context-rule]` section.
pub struct ContextRuleSpec {
    pub variable: String,
    pub rule: ContextRule,
}

/// An `[activity]` section.
pub struct ActivitySpec {
    pub variable: ActivityVariable,
}

/// Everything the config loader produces, ready to be installed into the
/// engine's classifier/group/context tables.
#[derive(Default)]
pub struct ParsedConfig {
    pub groups: Vec<GroupSpec>,
    pub devices: Vec<DeviceSpec>,
    pub streams: Vec<StreamSpec>,
    pub pid_overrides: Vec<PidOverride>,
    pub context_rules: Vec<ContextRuleSpec>,
    pub activities: Vec<ActivitySpec>,
}

/// Flag CSV expansion, including the `client`/`nopolicy` synonyms from
/// SPEC_FULL.md §2.1.
fn parse_flags_csv(csv: &str) -> Result<GroupFlags, ConfigError> {
    let mut flags = GroupFlags::empty();
    for token in csv.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let f = match token {
            "set_sink" => GroupFlags::SET_SINK,
            "set_source" => GroupFlags::SET_SOURCE,
            "route_audio" => GroupFlags::ROUTE_AUDIO,
            "limit_volume" => GroupFlags::LIMIT_VOLUME,
            "cork_stream" => GroupFlags::CORK_STREAM,
            "mute_by_route" => GroupFlags::MUTE_BY_ROUTE,
            "media_notify" => GroupFlags::MEDIA_NOTIFY,
            "client" => GroupFlags::client_synonym(),
            "nopolicy" => GroupFlags::empty(),
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        };
        flags |= f;
    }
    Ok(flags)
}

fn object_kind_from_prefix(prefix: &str) -> Result<ObjectKind, ConfigError> {
    match prefix {
        "module" => Ok(ObjectKind::Module),
        "card" => Ok(ObjectKind::Card),
        "sink" => Ok(ObjectKind::Sink),
        "source" => Ok(ObjectKind::Source),
        "sink-input" => Ok(ObjectKind::SinkInput),
        "source-output" => Ok(ObjectKind::SourceOutput),
        other => Err(ConfigError::UnknownObjectKind(other.to_string())),
    }
}

/// Parse an OBJECTREF: `{kind}-name@METHOD:ARG` (spec.md §4.8).
fn parse_object_ref(value: &str) -> Result<ObjectRefSpec, ConfigError> {
    let (prefix, rest) = value.split_once("-name@").ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected '{{kind}}-name@METHOD:ARG', got '{value}'"),
    })?;
    let kind = object_kind_from_prefix(prefix)?;
    let (method, arg) = parser::split_method_arg(rest)?;
    let match_expr = MatchExpr::from_method_arg(&method, &arg)?;
    Ok(ObjectRefSpec { kind, match_expr })
}

fn parse_set_property(value: &str) -> Result<(ObjectRefSpec, String, ValueSource), ConfigError> {
    let parts: Vec<&str> = value.splitn(3, ',').collect();
    let [object_ref_part, property_part, value_part] = parts[..] else {
        return Err(ConfigError::Parse {
            line: 0,
            reason: format!("expected 'OBJECTREF,property:PROP,value@...', got '{value}'"),
        });
    };
    let object_ref = parse_object_ref(object_ref_part)?;
    let property = property_part.strip_prefix("property:").ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'property:PROP', got '{property_part}'"),
    })?;
    let value_source_str = value_part.strip_prefix("value@").ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'value@...', got '{value_part}'"),
    })?;
    let value_source = if value_source_str == "copy-from-context" {
        ValueSource::CopyFromContextValue
    } else if let Some(constant) = value_source_str.strip_prefix("constant:") {
        ValueSource::Constant(constant.to_string())
    } else {
        return Err(ConfigError::Parse {
            line: 0,
            reason: format!("unknown value source '{value_source_str}'"),
        });
    };
    Ok((object_ref, property.to_string(), value_source))
}

fn parse_delete_property(value: &str) -> Result<(ObjectRefSpec, String), ConfigError> {
    let (object_ref_part, property_part) = value.split_once(',').ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'OBJECTREF,property:PROP', got '{value}'"),
    })?;
    let object_ref = parse_object_ref(object_ref_part)?;
    let property = property_part.strip_prefix("property:").ok_or_else(|| ConfigError::Parse {
        line: 0,
        reason: format!("expected 'property:PROP', got '{property_part}'"),
    })?;
    Ok((object_ref, property.to_string()))
}

fn object_ref_to_runtime(spec: ObjectRefSpec) -> ObjectRef {
    ObjectRef::new(spec.kind, spec.match_expr)
}

/// One in-progress section being accumulated while scanning a config file.
enum Section {
    None,
    Group(GroupSpecBuilder),
    Device(DeviceSpecBuilder),
    Card(DeviceSpecBuilder),
    Stream(StreamSpecBuilder),
    ContextRule(ContextRuleBuilder),
    Activity(ActivityBuilder),
}

#[derive(Default)]
struct GroupSpecBuilder {
    name: Option<String>,
    sink: Option<String>,
    source: Option<String>,
    properties: HashMap<String, String>,
    flags: GroupFlags,
}

#[derive(Default)]
struct DeviceSpecBuilder {
    class: Option<DeviceClass>,
    type_label: Option<String>,
    property: Option<String>,
    match_expr: Option<MatchExpr>,
    ports: HashMap<String, String>,
    profile: Option<Profile>,
    flags: u32,
}

#[derive(Default)]
struct StreamSpecBuilder {
    stnam: Option<String>,
    property: Option<String>,
    match_expr: Option<MatchExpr>,
    clnam: Option<String>,
    uid: Option<UidMatch>,
    exe: Option<String>,
    active_sink: Option<String>,
    group: Option<String>,
    flags: crate::classify::StreamLocalFlags,
    port_if_active: Option<String>,
}

#[derive(Default)]
struct ContextRuleBuilder {
    variable: Option<String>,
    value_match: Option<MatchExpr>,
    actions: Vec<Action>,
}

#[derive(Default)]
struct ActivityBuilder {
    sink_name_match: Option<MatchExpr>,
    device: Option<String>,
    active: Vec<Action>,
    inactive: Vec<Action>,
}

fn parse_uid(value: &str) -> UidMatch {
    match value.parse::<u32>() {
        Ok(n) => UidMatch::Numeric(n),
        Err(_) => UidMatch::Name(value.to_string()),
    }
}

/// Parse one preprocessed config file's contents into a [`ParsedConfig`],
/// accumulating onto the caller's existing output (so `*.conf` files merge
/// into the same table set the primary file started).
fn parse_into(text: &str, path: &Path, out: &mut ParsedConfig) -> Result<(), ConfigError> {
    let mut section = Section::None;

    macro_rules! flush {
        () => {
            flush_section(std::mem::replace(&mut section, Section::None), out, path)?;
        };
    }

    for (lineno, line_result) in parser::parse_lines(text) {
        let line = line_result.map_err(|e| reattach_path(e, path, lineno))?;
        match line {
            Line::Section(name) => {
                flush!();
                section = match name.as_str() {
                    "group" => Section::Group(GroupSpecBuilder::default()),
                    "device" => Section::Device(DeviceSpecBuilder::default()),
                    "card" => Section::Card(DeviceSpecBuilder::default()),
                    "stream" => Section::Stream(StreamSpecBuilder::default()),
                    "context-rule" => Section::ContextRule(ContextRuleBuilder::default()),
                    "activity" => Section::Activity(ActivityBuilder::default()),
                    other => {
                        warn!("{}:{}: unknown section '[{}]', ignoring until next header", path.display(), lineno, other);
                        Section::None
                    }
                };
            }
            Line::KeyValue(key, value) => {
                if let Err(e) = apply_key(&mut section, &key, &value) {
                    warn!("{}:{}: {}", path.display(), lineno, e);
                }
            }
            Line::Blank => {}
        }
    }
    flush!();
    Ok(())
}

fn reattach_path(e: ConfigError, path: &Path, lineno: usize) -> ConfigError {
    match e {
        ConfigError::Parse { reason, .. } => ConfigError::ParseAt {
            path: path.to_path_buf(),
            line: lineno,
            reason,
        },
        other => other,
    }
}

fn apply_key(section: &mut Section, key: &str, value: &str) -> Result<(), ConfigError> {
    match section {
        Section::None => Ok(()),
        Section::Group(b) => apply_group_key(b, key, value),
        Section::Device(b) => apply_device_key(b, key, value, None),
        Section::Card(b) => apply_device_key(b, key, value, Some(DeviceClass::Card)),
        Section::Stream(b) => apply_stream_key(b, key, value),
        Section::ContextRule(b) => apply_context_rule_key(b, key, value),
        Section::Activity(b) => apply_activity_key(b, key, value),
    }
}

fn apply_group_key(b: &mut GroupSpecBuilder, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "name" => b.name = Some(value.to_string()),
        "sink" => b.sink = Some(value.to_string()),
        "source" => b.source = Some(value.to_string()),
        "properties" => {
            for pair in value.split(';').filter(|s| !s.is_empty()) {
                if let Some((k, v)) = pair.split_once('=') {
                    b.properties.insert(k.to_string(), v.to_string());
                }
            }
        }
        "flags" => b.flags = parse_flags_csv(value)?,
        other => warn!("unknown [group] key '{other}'"),
    }
    Ok(())
}

fn apply_device_key(b: &mut DeviceSpecBuilder, key: &str, value: &str, forced_class: Option<DeviceClass>) -> Result<(), ConfigError> {
    match key {
        "type" => b.type_label = Some(value.to_string()),
        "sink" | "source" | "name0" | "name1" => {
            b.class = Some(forced_class.unwrap_or(if key == "source" { DeviceClass::Source } else { DeviceClass::Sink }));
            let (prop, method, arg) = parser::split_prop_method_arg(value)?;
            b.property = Some(prop);
            b.match_expr = Some(MatchExpr::from_method_arg(&method, &arg)?);
        }
        "ports" => {
            for pair in value.split(',').filter(|s| !s.is_empty()) {
                if let Some((name, port)) = pair.split_once(':') {
                    b.ports.insert(name.to_string(), port.to_string());
                }
            }
        }
        "profile0" | "profile1" | "profile" => {
            let (method, arg) = parser::split_method_arg(value)?;
            let _ = method;
            b.profile = Some(Profile(arg));
        }
        "flags" | "flags0" | "flags1" => {
            b.flags = value.parse().unwrap_or(0);
        }
        other => warn!("unknown [device]/[card] key '{other}'"),
    }
    Ok(())
}

fn apply_stream_key(b: &mut StreamSpecBuilder, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "name" => {
            b.stnam = Some(value.to_string());
            b.property = Some("name".to_string());
            b.match_expr = Some(MatchExpr::Equals(value.to_string()));
        }
        "property" => {
            let (prop, method, arg) = parser::split_prop_method_arg(value)?;
            b.property = Some(prop);
            b.match_expr = Some(MatchExpr::from_method_arg(&method, &arg)?);
        }
        "client" => b.clnam = Some(value.to_string()),
        "sink" => b.active_sink = Some(value.to_string()),
        "user" => b.uid = Some(parse_uid(value)),
        "exe" => b.exe = Some(value.to_string()),
        "group" => b.group = Some(value.to_string()),
        "flags" => {
            for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                b.flags |= match token {
                    "local_route" => crate::classify::StreamLocalFlags::LOCAL_ROUTE,
                    "local_mute" => crate::classify::StreamLocalFlags::LOCAL_MUTE,
                    "local_volmax" => crate::classify::StreamLocalFlags::LOCAL_VOLMAX,
                    other => return Err(ConfigError::UnknownFlag(other.to_string())),
                };
            }
        }
        "port_if_active" => b.port_if_active = Some(value.to_string()),
        other => warn!("unknown [stream] key '{other}'"),
    }
    Ok(())
}

fn apply_context_rule_key(b: &mut ContextRuleBuilder, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "variable" => b.variable = Some(value.to_string()),
        "value" => {
            let (method, arg) = parser::split_method_arg(value)?;
            b.value_match = Some(MatchExpr::from_method_arg(&method, &arg)?);
        }
        "set-property" => {
            let (object_ref, property, value_source) = parse_set_property(value)?;
            b.actions.push(Action::SetProperty {
                object_ref: object_ref_to_runtime(object_ref),
                property,
                value_source,
            });
        }
        "delete-property" => {
            let (object_ref, property) = parse_delete_property(value)?;
            b.actions.push(Action::DeleteProperty {
                object_ref: object_ref_to_runtime(object_ref),
                property,
            });
        }
        other => warn!("unknown [context-rule] key '{other}'"),
    }
    Ok(())
}

fn apply_activity_key(b: &mut ActivityBuilder, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "sink-name" => {
            let (method, arg) = parser::split_method_arg(value)?;
            b.sink_name_match = Some(MatchExpr::from_method_arg(&method, &arg)?);
        }
        "device" => b.device = Some(value.to_string()),
        "active" => {
            let (object_ref, property, value_source) = parse_set_property(value)?;
            b.active.push(Action::SetProperty {
                object_ref: object_ref_to_runtime(object_ref),
                property,
                value_source,
            });
        }
        "inactive" => {
            let (object_ref, property, value_source) = parse_set_property(value)?;
            b.inactive.push(Action::SetProperty {
                object_ref: object_ref_to_runtime(object_ref),
                property,
                value_source,
            });
        }
        other => warn!("unknown [activity] key '{other}'"),
    }
    Ok(())
}

fn flush_section(section: Section, out: &mut ParsedConfig, path: &Path) -> Result<(), ConfigError> {
    match section {
        Section::None => {}
        Section::Group(b) => {
            let Some(name) = b.name else {
                warn!("{}: [group] section missing 'name', dropping", path.display());
                return Ok(());
            };
            out.groups.push(GroupSpec {
                name,
                sink: b.sink,
                source: b.source,
                properties: b.properties,
                flags: b.flags,
            });
        }
        Section::Device(b) | Section::Card(b) => {
            let (Some(class), Some(type_label), Some(property), Some(match_expr)) =
                (b.class, b.type_label, b.property, b.match_expr)
            else {
                warn!("{}: device/card section missing class/type/match, dropping", path.display());
                return Ok(());
            };
            out.devices.push(DeviceSpec {
                class,
                type_label,
                property,
                match_expr,
                data: DeviceRuleData {
                    flags: b.flags,
                    target_profile: b.profile,
                    port_map: b.ports,
                },
            });
        }
        Section::Stream(b) => {
            let (Some(property), Some(match_expr), Some(group)) = (b.property, b.match_expr, b.group) else {
                warn!("{}: [stream] section missing property/match/group, dropping", path.display());
                return Ok(());
            };
            out.streams.push(StreamSpec(StreamRule {
                property,
                match_expr,
                clnam: b.clnam,
                uid: b.uid,
                exe: b.exe,
                stnam: b.stnam,
                active_sink: b.active_sink,
                group_name: group,
                flags: b.flags,
                local_route_port: b.port_if_active,
            }));
        }
        Section::ContextRule(b) => {
            let (Some(variable), Some(value_match)) = (b.variable, b.value_match) else {
                warn!("{}: [context-rule] section missing variable/value, dropping", path.display());
                return Ok(());
            };
            out.context_rules.push(ContextRuleSpec {
                variable,
                rule: ContextRule {
                    value_match,
                    actions: b.actions,
                },
            });
        }
        Section::Activity(b) => {
            let (Some(sink_name_match), Some(device)) = (b.sink_name_match, b.device) else {
                warn!("{}: [activity] section missing sink-name/device, dropping", path.display());
                return Ok(());
            };
            let mut var = ActivityVariable::new(device);
            var.active_rules.push(ActivityRule {
                sink_name_match: sink_name_match.clone(),
                actions: b.active,
            });
            var.inactive_rules.push(ActivityRule {
                sink_name_match,
                actions: b.inactive,
            });
            out.activities.push(ActivitySpec { variable: var });
        }
    }
    Ok(())
}

/// Owns the primary config file path and an optional directory of `*.conf`
/// overlays, mirroring the teacher's `ConfigManager` shape
/// (`sootmix-daemon/src/config.rs`) while the grammar itself is original.
pub struct ConfigManager {
    config_file: PathBuf,
    config_dir: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config_file: PathBuf, config_dir: Option<PathBuf>) -> Self {
        Self { config_file, config_dir }
    }

    /// Load the primary file (required) plus every `*.conf` file in
    /// `config_dir` (optional directory; parse errors there are logged and
    /// the offending file skipped rather than failing startup), honoring
    /// `*.conf.override` shadowing its base name (spec.md §4.8).
    pub fn load(&self) -> Result<ParsedConfig, ConfigError> {
        let mut out = ParsedConfig::default();

        let primary = fs::read_to_string(&self.config_file).map_err(|source| ConfigError::Io {
            path: self.config_file.clone(),
            source,
        })?;
        parse_into(&primary, &self.config_file, &mut out)?;

        if let Some(dir) = &self.config_dir {
            for path in shadowed_conf_files(dir)? {
                match fs::read_to_string(&path) {
                    Ok(text) => {
                        if let Err(e) = parse_into(&text, &path, &mut out) {
                            warn!("skipping '{}': {}", path.display(), e);
                        }
                    }
                    Err(e) => warn!("skipping unreadable '{}': {}", path.display(), e),
                }
            }
        }

        if out.groups.is_empty() && out.streams.is_empty() && out.devices.is_empty() {
            return Err(ConfigError::NoRulesLoaded);
        }
        debug!(
            "config loaded: {} groups, {} devices, {} streams, {} context-rules, {} activities",
            out.groups.len(),
            out.devices.len(),
            out.streams.len(),
            out.context_rules.len(),
            out.activities.len()
        );
        Ok(out)
    }
}

/// List `*.conf` files in `dir`, with any `name.conf.override` replacing
/// `name.conf` rather than being loaded alongside it.
fn shadowed_conf_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(Vec::new()),
    };
    // Two passes: collect base `.conf` files first, then let any
    // `.conf.override` unconditionally replace its base's entry regardless
    // of directory iteration order.
    let mut final_map: HashMap<String, PathBuf> = HashMap::new();
    let paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    for path in &paths {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.ends_with(".conf.override") {
            continue;
        }
        if let Some(stem) = file_name.strip_suffix(".conf") {
            final_map.insert(stem.to_string(), path.clone());
        }
    }
    for path in &paths {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(".conf.override") {
            final_map.insert(stem.to_string(), path.clone());
        }
    }
    let mut result: Vec<PathBuf> = final_map.into_values().collect();
    result.sort();
    Ok(result)
}
