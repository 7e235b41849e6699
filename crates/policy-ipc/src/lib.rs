// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared PDP (policy decision point) wire types and D-Bus contract
//! constants for `policyd`.
//!
//! This crate defines the wire-level protocol between the policy engine
//! daemon and the external policy decision point it takes its routing,
//! volume, cork, mute and context decisions from. It does not depend on
//! the engine itself so that the contract can be versioned and tested
//! independently of the classifier/group/context implementation.

use std::collections::HashMap;
use zbus::zvariant::OwnedValue;

/// Default well-known D-Bus interface name the PDP signals are carried on.
pub const DEFAULT_DBUS_IF_NAME: &str = "com.nokia.policy";

/// Default object path this daemon registers itself at.
pub const DEFAULT_MY_PATH: &str = "/com/nokia/policy/enforce/pulseaudio";

/// Default well-known bus name this daemon claims.
pub const DEFAULT_MY_NAME: &str = "com.nokia.policy.pulseaudio";

/// Default object path the PDP itself is expected to live at.
pub const DEFAULT_POLICYD_PATH: &str = "/com/nokia/policy";

/// Inbound action names recognized inside an `audio_actions` batch.
pub const ACTION_AUDIO_ROUTE: &str = "com.nokia.policy.audio_route";
/// Volume limit action name.
pub const ACTION_VOLUME_LIMIT: &str = "com.nokia.policy.volume_limit";
/// Cork/uncork action name.
pub const ACTION_AUDIO_CORK: &str = "com.nokia.policy.audio_cork";
/// Mute/unmute action name.
pub const ACTION_AUDIO_MUTE: &str = "com.nokia.policy.audio_mute";
/// Context-variable-set action name.
pub const ACTION_CONTEXT: &str = "com.nokia.policy.context";

/// Maximum `audio_route` decisions accepted in a single batch (spec §7 overflow rule).
pub const MAX_ROUTE_DECISIONS_PER_BATCH: usize = 2;

/// An argument of a single action struct: `{name, variant}`.
pub type ActionArg = (String, OwnedValue);

/// One action instance: an ordered list of named, variant-typed arguments.
pub type ActionArgs = Vec<ActionArg>;

/// A decoded `audio_actions` batch: action name -> list of action instances.
pub type ActionBatch = HashMap<String, Vec<ActionArgs>>;

/// Errors produced while decoding or dispatching PDP wire messages.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    /// A named group does not exist in the engine.
    #[error("group not found: {0}")]
    GroupNotFound(String),
    /// A named context variable does not exist in the engine.
    #[error("context variable not found: {0}")]
    VariableNotFound(String),
    /// An action struct was missing a required argument or had the wrong type.
    #[error("malformed {action} action: {reason}")]
    InvalidAction { action: String, reason: String },
    /// Catch-all for host/internal failures surfaced to the bus.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PolicyError> for zbus::fdo::Error {
    fn from(e: PolicyError) -> Self {
        zbus::fdo::Error::Failed(e.to_string())
    }
}

/// Helper to pull a string out of a decoded action argument list by key.
/// Tries both `&str` and `String` downcasts since the wire representation
/// depends on what the PDP actually sent.
pub fn arg_str(args: &ActionArgs, key: &str) -> Option<String> {
    let (_, v) = args.iter().find(|(name, _)| name == key)?;
    if let Ok(s) = v.downcast_ref::<&str>() {
        return Some(s.to_string());
    }
    if let Ok(s) = v.downcast_ref::<String>() {
        return Some(s);
    }
    None
}

/// Helper to pull an `i32` out of a decoded action argument list by key.
pub fn arg_i32(args: &ActionArgs, key: &str) -> Option<i32> {
    let (_, v) = args.iter().find(|(name, _)| name == key)?;
    v.downcast_ref::<i32>().ok()
}

/// A fully-decoded `audio_route` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRouteAction {
    pub class: RouteClass,
    pub device: String,
    pub mode: String,
    pub hwid: String,
}

/// Route target class: sink (playback) or source (capture).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Sink,
    Source,
}

impl TryFrom<&ActionArgs> for AudioRouteAction {
    type Error = PolicyError;

    fn try_from(args: &ActionArgs) -> Result<Self, Self::Error> {
        let err = |reason: &str| PolicyError::InvalidAction {
            action: ACTION_AUDIO_ROUTE.to_string(),
            reason: reason.to_string(),
        };
        let ty = arg_str(args, "type").ok_or_else(|| err("missing 'type'"))?;
        let class = match ty.as_str() {
            "sink" => RouteClass::Sink,
            "source" => RouteClass::Source,
            other => return Err(err(&format!("unknown type '{other}'"))),
        };
        let device = arg_str(args, "device").ok_or_else(|| err("missing 'device'"))?;
        let mode = arg_str(args, "mode").unwrap_or_else(|| "na".to_string());
        let hwid = arg_str(args, "hwid").unwrap_or_default();
        Ok(Self {
            class,
            device,
            mode,
            hwid,
        })
    }
}

/// A fully-decoded `volume_limit` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLimitAction {
    pub group: String,
    pub limit: i32,
}

impl TryFrom<&ActionArgs> for VolumeLimitAction {
    type Error = PolicyError;

    fn try_from(args: &ActionArgs) -> Result<Self, Self::Error> {
        let err = |reason: &str| PolicyError::InvalidAction {
            action: ACTION_VOLUME_LIMIT.to_string(),
            reason: reason.to_string(),
        };
        let group = arg_str(args, "group").ok_or_else(|| err("missing 'group'"))?;
        let limit = arg_i32(args, "limit").ok_or_else(|| err("missing 'limit'"))?;
        if !(0..=100).contains(&limit) {
            return Err(err("limit out of range 0..=100"));
        }
        Ok(Self { group, limit })
    }
}

/// A fully-decoded `audio_cork` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCorkAction {
    pub group: String,
    pub corked: bool,
}

impl TryFrom<&ActionArgs> for AudioCorkAction {
    type Error = PolicyError;

    fn try_from(args: &ActionArgs) -> Result<Self, Self::Error> {
        let err = |reason: &str| PolicyError::InvalidAction {
            action: ACTION_AUDIO_CORK.to_string(),
            reason: reason.to_string(),
        };
        let group = arg_str(args, "group").ok_or_else(|| err("missing 'group'"))?;
        let corked = match arg_str(args, "cork").ok_or_else(|| err("missing 'cork'"))?.as_str() {
            "corked" => true,
            "uncorked" => false,
            other => return Err(err(&format!("unknown cork state '{other}'"))),
        };
        Ok(Self { group, corked })
    }
}

/// A fully-decoded `audio_mute` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMuteAction {
    pub device: String,
    pub muted: bool,
}

impl TryFrom<&ActionArgs> for AudioMuteAction {
    type Error = PolicyError;

    fn try_from(args: &ActionArgs) -> Result<Self, Self::Error> {
        let err = |reason: &str| PolicyError::InvalidAction {
            action: ACTION_AUDIO_MUTE.to_string(),
            reason: reason.to_string(),
        };
        let device = arg_str(args, "device").ok_or_else(|| err("missing 'device'"))?;
        let muted = match arg_str(args, "mute").ok_or_else(|| err("missing 'mute'"))?.as_str() {
            "muted" => true,
            "unmuted" => false,
            other => return Err(err(&format!("unknown mute state '{other}'"))),
        };
        Ok(Self { device, muted })
    }
}

/// A fully-decoded `context` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextAction {
    pub variable: String,
    pub value: String,
}

impl TryFrom<&ActionArgs> for ContextAction {
    type Error = PolicyError;

    fn try_from(args: &ActionArgs) -> Result<Self, Self::Error> {
        let err = |reason: &str| PolicyError::InvalidAction {
            action: ACTION_CONTEXT.to_string(),
            reason: reason.to_string(),
        };
        let variable = arg_str(args, "variable")
            .ok_or_else(|| err("missing 'variable'"))?
            .to_string();
        let value = arg_str(args, "value")
            .ok_or_else(|| err("missing 'value'"))?
            .to_string();
        Ok(Self { variable, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::Value;

    fn args(pairs: &[(&str, Value<'_>)]) -> ActionArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OwnedValue::try_from(v.clone()).unwrap()))
            .collect()
    }

    #[test]
    fn decodes_audio_route_action() {
        let a = args(&[
            ("type", Value::from("sink")),
            ("device", Value::from("ihf")),
            ("mode", Value::from("hf")),
            ("hwid", Value::from("xy")),
        ]);
        let route = AudioRouteAction::try_from(&a).unwrap();
        assert_eq!(route.class, RouteClass::Sink);
        assert_eq!(route.device, "ihf");
        assert_eq!(route.mode, "hf");
    }

    #[test]
    fn rejects_unknown_route_class() {
        let a = args(&[("type", Value::from("bogus")), ("device", Value::from("x"))]);
        assert!(AudioRouteAction::try_from(&a).is_err());
    }

    #[test]
    fn route_defaults_mode_and_hwid() {
        let a = args(&[("type", Value::from("source")), ("device", Value::from("mic"))]);
        let route = AudioRouteAction::try_from(&a).unwrap();
        assert_eq!(route.mode, "na");
        assert_eq!(route.hwid, "");
    }

    #[test]
    fn decodes_volume_limit_action() {
        let a = args(&[("group", Value::from("G")), ("limit", Value::from(50i32))]);
        let v = VolumeLimitAction::try_from(&a).unwrap();
        assert_eq!(v.group, "G");
        assert_eq!(v.limit, 50);
    }

    #[test]
    fn rejects_out_of_range_volume_limit() {
        let a = args(&[("group", Value::from("G")), ("limit", Value::from(150i32))]);
        assert!(VolumeLimitAction::try_from(&a).is_err());
    }

    #[test]
    fn decodes_cork_and_mute_actions() {
        let cork = args(&[("group", Value::from("G")), ("cork", Value::from("corked"))]);
        assert!(AudioCorkAction::try_from(&cork).unwrap().corked);
        let mute = args(&[("device", Value::from("d")), ("mute", Value::from("unmuted"))]);
        assert!(!AudioMuteAction::try_from(&mute).unwrap().muted);
    }

    #[test]
    fn decodes_context_action() {
        let a = args(&[("variable", Value::from("V")), ("value", Value::from("on"))]);
        let c = ContextAction::try_from(&a).unwrap();
        assert_eq!(c.variable, "V");
        assert_eq!(c.value, "on");
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let a = args(&[("group", Value::from("G"))]);
        assert!(VolumeLimitAction::try_from(&a).is_err());
    }
}
