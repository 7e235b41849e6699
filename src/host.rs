// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Host adapters (component G): thin wrappers over the audio-server's own
//! objects. The audio server itself is an external collaborator (spec.md
//! §1 Out of scope) - this module only defines the shapes the engine reads
//! and the operations it asks the host to perform, as a trait so the
//! engine can be exercised without a live PipeWire/PulseAudio connection.

use std::collections::HashMap;
use thiserror::Error;

/// Sentinel returned for an absent or empty classification property.
pub const UNKNOWN: &str = "<unknown>";

/// The six kinds of audio-server object the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Module,
    Card,
    Sink,
    Source,
    SinkInput,
    SourceOutput,
}

/// A host proplist: an unordered string->string bag of properties.
pub type Proplist = HashMap<String, String>;

/// Look up a classification property on a proplist, applying the `name`
/// alias (-> `media.name`) and the `<unknown>` sentinel for spec.md §3.
pub fn get_property(proplist: &Proplist, property: &str) -> String {
    let key = if property == "name" { "media.name" } else { property };
    match proplist.get(key) {
        Some(v) if !v.is_empty() => v.clone(),
        _ => UNKNOWN.to_string(),
    }
}

/// Context about the client that owns a stream, used by pid overrides and
/// stream rules (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub name: Option<String>,
    pub exe: Option<String>,
}

/// Snapshot of a not-yet-constructed stream, as classification sees it
/// during `stream-new` (spec.md §4.2): the only data available is the
/// proplist the client supplied plus the sink it's targeting, if any.
#[derive(Debug, Clone, Default)]
pub struct NewStreamData {
    pub proplist: Proplist,
    pub stream_name: Option<String>,
    pub active_sink: Option<String>,
}

/// A fully realized host object: index, canonical name, and proplist.
#[derive(Debug, Clone)]
pub struct HostObject {
    pub index: u32,
    pub name: String,
    pub proplist: Proplist,
}

impl HostObject {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            proplist: Proplist::new(),
        }
    }
}

/// Resolves a `user=` stream-rule value against a host-specific mechanism
/// (e.g. `getpwnam`) when the config value isn't a bare integer. Kept
/// behind a trait so the classifier never takes a hard dependency on the
/// system user database (SPEC_FULL.md §2.2).
pub trait UserLookup {
    fn resolve_uid(&self, name: &str) -> Option<u32>;
}

/// A `UserLookup` that never resolves anything; useful for hosts/tests that
/// only exercise numeric uid matching.
pub struct NoUserLookup;

impl UserLookup for NoUserLookup {
    fn resolve_uid(&self, _name: &str) -> Option<u32> {
        None
    }
}

/// Profile selection for a card, as named by a device/card rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile(pub String);

/// Errors a host operation can fail with. The engine logs these and keeps
/// running in a degraded state per spec.md §7; it never propagates a host
/// failure into a panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("object not found: {0:?} index {1}")]
    NotFound(ObjectKind, u32),
    #[error("move failed: {0}")]
    MoveFailed(String),
    #[error("set_profile failed: {0}")]
    SetProfileFailed(String),
    #[error("set_ports failed: {0}")]
    SetPortsFailed(String),
    #[error("host operation unsupported: {0}")]
    Unsupported(String),
}

/// Operations the engine performs against the live audio server.
///
/// A production binary backs this with real PipeWire/PulseAudio calls; the
/// engine's own tests back it with an in-memory recorder (see
/// `host::test_support`).
pub trait HostAdapter {
    /// Begin detaching a stream from its current sink/source (move phase A).
    fn start_move(&mut self, kind: ObjectKind, index: u32) -> Result<(), HostError>;

    /// Finish attaching a previously-detached stream to `target` (move phase C).
    fn finish_move(&mut self, kind: ObjectKind, index: u32, target: u32) -> Result<(), HostError>;

    /// Attempt to switch a card to the given profile.
    fn set_profile(&mut self, card_index: u32, profile: &Profile) -> Result<(), HostError>;

    /// Attempt to switch a sink/source's active port.
    fn set_ports(&mut self, kind: ObjectKind, index: u32, port: &str) -> Result<(), HostError>;

    /// Cork (`true`) or uncork (`false`) a sink-input.
    fn set_corked(&mut self, sink_input: u32, corked: bool) -> Result<(), HostError>;

    /// Set a per-channel volume multiplier ("soft volume") for a stream.
    fn set_volume_factor(&mut self, kind: ObjectKind, index: u32, factors: &[f64]) -> Result<(), HostError>;

    /// Set a sink/source's local mute bit directly (used by `mute_source`).
    fn set_mute(&mut self, kind: ObjectKind, index: u32, muted: bool) -> Result<(), HostError>;

    /// Set one property on a host object and fire its proplist-changed hook.
    fn set_property(&mut self, kind: ObjectKind, index: u32, key: &str, value: &str) -> Result<(), HostError>;

    /// Remove one property from a host object and fire its proplist-changed hook.
    fn delete_property(&mut self, kind: ObjectKind, index: u32, key: &str) -> Result<(), HostError>;

    /// Read a property currently set on a host object, if any. Used by the
    /// context engine to skip a `set_property` that would be a no-op.
    fn get_property(&self, kind: ObjectKind, index: u32, key: &str) -> Option<String>;

    /// True if the host reports flat (per-stream hardware) volumes rather
    /// than software-mixed volumes; determines whether `set_group_limit`
    /// pushes a soft-volume directly or requests host re-propagation.
    fn uses_flat_volumes(&self) -> bool;

    /// Resolve a device-classification `target-type` label to a concrete
    /// host sink/source index, if one is currently known.
    fn resolve_target(&self, kind: ObjectKind, type_label: &str) -> Option<u32>;

    /// The configured null-sink index, if one was supplied at startup.
    fn null_sink(&self) -> Option<u32>;

    /// The card that backs a sink/source, if known; used by move-to Phase B
    /// to attempt a profile switch on the card behind a newly chosen route
    /// target (spec.md §4.4). Default `None` for hosts that don't track it.
    fn backing_card(&self, _kind: ObjectKind, _index: u32) -> Option<u32> {
        None
    }

    /// Enumerate every currently known object of `kind` with its proplist;
    /// used by `mute_source` to resolve a type-label mute request (spec.md
    /// §4.4). Default empty for hosts that don't track a live object list.
    fn list_objects(&self, _kind: ObjectKind) -> Vec<(u32, Proplist)> {
        Vec::new()
    }
}

/// A placeholder [`HostAdapter`] that accepts every call and changes
/// nothing. The real audio-server binding (PipeWire/PulseAudio proxies,
/// subscription hooks) is an external collaborator (spec.md §1 Out of
/// scope) and is not part of this engine; this adapter is the seam a
/// production build wires a live one into, kept here so the binary links
/// and runs end-to-end against the D-Bus/config surface on its own.
pub struct NullHostAdapter {
    null_sink: Option<u32>,
}

impl NullHostAdapter {
    pub fn new(null_sink: Option<u32>) -> Self {
        Self { null_sink }
    }
}

impl HostAdapter for NullHostAdapter {
    fn start_move(&mut self, kind: ObjectKind, index: u32) -> Result<(), HostError> {
        tracing::debug!(?kind, index, "start_move (no host attached)");
        Ok(())
    }

    fn finish_move(&mut self, kind: ObjectKind, index: u32, target: u32) -> Result<(), HostError> {
        tracing::debug!(?kind, index, target, "finish_move (no host attached)");
        Ok(())
    }

    fn set_profile(&mut self, card_index: u32, profile: &Profile) -> Result<(), HostError> {
        tracing::debug!(card_index, profile = %profile.0, "set_profile (no host attached)");
        Ok(())
    }

    fn set_ports(&mut self, kind: ObjectKind, index: u32, port: &str) -> Result<(), HostError> {
        tracing::debug!(?kind, index, port, "set_ports (no host attached)");
        Ok(())
    }

    fn set_corked(&mut self, sink_input: u32, corked: bool) -> Result<(), HostError> {
        tracing::debug!(sink_input, corked, "set_corked (no host attached)");
        Ok(())
    }

    fn set_volume_factor(&mut self, kind: ObjectKind, index: u32, factors: &[f64]) -> Result<(), HostError> {
        tracing::debug!(?kind, index, ?factors, "set_volume_factor (no host attached)");
        Ok(())
    }

    fn set_mute(&mut self, kind: ObjectKind, index: u32, muted: bool) -> Result<(), HostError> {
        tracing::debug!(?kind, index, muted, "set_mute (no host attached)");
        Ok(())
    }

    fn set_property(&mut self, kind: ObjectKind, index: u32, key: &str, value: &str) -> Result<(), HostError> {
        tracing::debug!(?kind, index, key, value, "set_property (no host attached)");
        Ok(())
    }

    fn delete_property(&mut self, kind: ObjectKind, index: u32, key: &str) -> Result<(), HostError> {
        tracing::debug!(?kind, index, key, "delete_property (no host attached)");
        Ok(())
    }

    fn get_property(&self, _kind: ObjectKind, _index: u32, _key: &str) -> Option<String> {
        None
    }

    fn uses_flat_volumes(&self) -> bool {
        false
    }

    fn resolve_target(&self, _kind: ObjectKind, _type_label: &str) -> Option<u32> {
        None
    }

    fn null_sink(&self) -> Option<u32> {
        self.null_sink
    }
}

/// An in-memory [`HostAdapter`] used by unit tests: records every call it
/// receives instead of touching a real audio server.
#[cfg(test)]
pub mod test_support {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        StartMove(ObjectKind, u32),
        FinishMove(ObjectKind, u32, u32),
        SetProfile(u32, Profile),
        SetPorts(ObjectKind, u32, String),
        SetCorked(u32, bool),
        SetVolumeFactor(ObjectKind, u32, Vec<f64>),
        SetMute(ObjectKind, u32, bool),
        SetProperty(ObjectKind, u32, String, String),
        DeleteProperty(ObjectKind, u32, String),
    }

    #[derive(Default)]
    pub struct RecordingHost {
        pub calls: Vec<Call>,
        pub flat_volumes: bool,
        pub targets: HashMap<(ObjectKind, String), u32>,
        pub null_sink: Option<u32>,
        pub fail_moves: bool,
        pub properties: HashMap<(ObjectKind, u32), Proplist>,
    }

    impl HostAdapter for RecordingHost {
        fn start_move(&mut self, kind: ObjectKind, index: u32) -> Result<(), HostError> {
            if self.fail_moves {
                return Err(HostError::MoveFailed("forced failure".into()));
            }
            self.calls.push(Call::StartMove(kind, index));
            Ok(())
        }

        fn finish_move(&mut self, kind: ObjectKind, index: u32, target: u32) -> Result<(), HostError> {
            if self.fail_moves {
                return Err(HostError::MoveFailed("forced failure".into()));
            }
            self.calls.push(Call::FinishMove(kind, index, target));
            Ok(())
        }

        fn set_profile(&mut self, card_index: u32, profile: &Profile) -> Result<(), HostError> {
            self.calls.push(Call::SetProfile(card_index, profile.clone()));
            Ok(())
        }

        fn set_ports(&mut self, kind: ObjectKind, index: u32, port: &str) -> Result<(), HostError> {
            self.calls.push(Call::SetPorts(kind, index, port.to_string()));
            Ok(())
        }

        fn set_corked(&mut self, sink_input: u32, corked: bool) -> Result<(), HostError> {
            self.calls.push(Call::SetCorked(sink_input, corked));
            Ok(())
        }

        fn set_volume_factor(&mut self, kind: ObjectKind, index: u32, factors: &[f64]) -> Result<(), HostError> {
            self.calls
                .push(Call::SetVolumeFactor(kind, index, factors.to_vec()));
            Ok(())
        }

        fn set_mute(&mut self, kind: ObjectKind, index: u32, muted: bool) -> Result<(), HostError> {
            self.calls.push(Call::SetMute(kind, index, muted));
            Ok(())
        }

        fn set_property(&mut self, kind: ObjectKind, index: u32, key: &str, value: &str) -> Result<(), HostError> {
            self.properties
                .entry((kind, index))
                .or_default()
                .insert(key.to_string(), value.to_string());
            self.calls
                .push(Call::SetProperty(kind, index, key.to_string(), value.to_string()));
            Ok(())
        }

        fn delete_property(&mut self, kind: ObjectKind, index: u32, key: &str) -> Result<(), HostError> {
            if let Some(p) = self.properties.get_mut(&(kind, index)) {
                p.remove(key);
            }
            self.calls
                .push(Call::DeleteProperty(kind, index, key.to_string()));
            Ok(())
        }

        fn get_property(&self, kind: ObjectKind, index: u32, key: &str) -> Option<String> {
            self.properties.get(&(kind, index)).and_then(|p| p.get(key)).cloned()
        }

        fn uses_flat_volumes(&self) -> bool {
            self.flat_volumes
        }

        fn resolve_target(&self, kind: ObjectKind, type_label: &str) -> Option<u32> {
            self.targets.get(&(kind, type_label.to_string())).copied()
        }

        fn null_sink(&self) -> Option<u32> {
            self.null_sink
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_alias_resolves_media_name() {
        let mut p = Proplist::new();
        p.insert("media.name".to_string(), "alert".to_string());
        assert_eq!(get_property(&p, "name"), "alert");
    }

    #[test]
    fn absent_property_resolves_to_unknown_sentinel() {
        let p = Proplist::new();
        assert_eq!(get_property(&p, "application.name"), UNKNOWN);
    }

    #[test]
    fn empty_property_resolves_to_unknown_sentinel() {
        let mut p = Proplist::new();
        p.insert("application.name".to_string(), String::new());
        assert_eq!(get_property(&p, "application.name"), UNKNOWN);
    }

    #[test]
    fn literal_property_key_is_read_verbatim() {
        let mut p = Proplist::new();
        p.insert("application.process.binary".to_string(), "firefox".to_string());
        assert_eq!(get_property(&p, "application.process.binary"), "firefox");
    }
}
