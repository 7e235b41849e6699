// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PDP (policy decision point) transport (component H): the D-Bus contract
//! between this engine and the external decision point that drives its
//! routing, volume, cork, mute and context actions.

use policy_ipc::{
    ActionArgs, ActionBatch, AudioCorkAction, AudioMuteAction, AudioRouteAction, ContextAction,
    PolicyError, RouteClass, VolumeLimitAction, ACTION_AUDIO_CORK, ACTION_AUDIO_MUTE,
    ACTION_AUDIO_ROUTE, ACTION_CONTEXT, ACTION_VOLUME_LIMIT, MAX_ROUTE_DECISIONS_PER_BATCH,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Fixed budget for the PDP registration call (spec.md §5).
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("PDP registration timed out after {0:?}")]
    RegistrationTimeout(Duration),
    #[error("PDP registration failed: {0}")]
    RegistrationFailed(#[from] zbus::Error),
}

/// Outbound method call and inbound signal shapes, as a `#[zbus::proxy]`
/// trait against the PDP's own bus name/path (spec.md §4.7).
#[zbus::proxy(default_path = "/com/nokia/policy", interface = "com.nokia.policy")]
pub trait PdpControl {
    /// Register this daemon's name and the signal list it wants delivered.
    async fn register(&self, name: &str, signals: Vec<&str>) -> zbus::Result<()>;
}

/// Inbound signals the PDP emits, subscribed to via the generated
/// `receive_*` streams on a built proxy instance.
#[zbus::proxy(default_path = "/com/nokia/policy", interface = "com.nokia.policy")]
pub trait PdpEvents {
    #[zbus(signal)]
    fn stream_info(
        &self,
        txid: u32,
        op: String,
        group: String,
        pid: u32,
        stream_hint: String,
        method_name: String,
        property: String,
    );

    #[zbus(signal)]
    fn audio_actions(&self, txid: u32, actions: std::collections::HashMap<String, Vec<ActionArgs>>);
}

/// Register with the PDP, honoring the fixed 10s budget (spec.md §5). A
/// timeout yields a logged failure with no state mutation.
pub async fn register_with_pdp(
    connection: &zbus::Connection,
    pdp_bus_name: &str,
    pdp_path: &str,
    my_name: &str,
    signals: &[&str],
) -> Result<(), TransportError> {
    let proxy = PdpControlProxy::builder(connection)
        .destination(pdp_bus_name.to_string())?
        .path(pdp_path.to_string())?
        .build()
        .await?;

    match tokio::time::timeout(REGISTRATION_TIMEOUT, proxy.register(my_name, signals.to_vec())).await {
        Ok(Ok(())) => {
            info!("registered with PDP at {pdp_bus_name}");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("PDP registration failed: {e}");
            Err(TransportError::RegistrationFailed(e))
        }
        Err(_) => {
            error!("PDP registration timed out after {REGISTRATION_TIMEOUT:?}");
            Err(TransportError::RegistrationTimeout(REGISTRATION_TIMEOUT))
        }
    }
}

/// Decoded, order-preserved actions from one `audio_actions` batch
/// (spec.md §6). Device moves must run strictly before the status ack
/// (spec.md §5), so callers process this in order and ack only once done.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub routes: Vec<AudioRouteAction>,
    pub volume_limits: Vec<VolumeLimitAction>,
    pub corks: Vec<AudioCorkAction>,
    pub mutes: Vec<AudioMuteAction>,
    pub context_sets: Vec<ContextAction>,
}

/// Decode a raw `audio_actions` batch. Unknown action names are silently
/// ignored; any malformed action body fails the whole batch (spec.md §6).
pub fn decode_batch(batch: &ActionBatch) -> Result<DecodedBatch, PolicyError> {
    let mut out = DecodedBatch::default();

    for (action_name, instances) in batch {
        match action_name.as_str() {
            ACTION_AUDIO_ROUTE => {
                for args in instances {
                    out.routes.push(AudioRouteAction::try_from(args)?);
                }
                if out.routes.len() > MAX_ROUTE_DECISIONS_PER_BATCH {
                    warn!(
                        "audio_actions batch carried {} route decisions, more than the {} budget; dropping the excess",
                        out.routes.len(),
                        MAX_ROUTE_DECISIONS_PER_BATCH
                    );
                    out.routes.truncate(MAX_ROUTE_DECISIONS_PER_BATCH);
                }
            }
            ACTION_VOLUME_LIMIT => {
                for args in instances {
                    out.volume_limits.push(VolumeLimitAction::try_from(args)?);
                }
            }
            ACTION_AUDIO_CORK => {
                for args in instances {
                    out.corks.push(AudioCorkAction::try_from(args)?);
                }
            }
            ACTION_AUDIO_MUTE => {
                for args in instances {
                    out.mutes.push(AudioMuteAction::try_from(args)?);
                }
            }
            ACTION_CONTEXT => {
                for args in instances {
                    out.context_sets.push(ContextAction::try_from(args)?);
                }
            }
            other => {
                warn!("ignoring unknown PDP action '{other}'");
            }
        }
    }

    Ok(out)
}

/// Whether `name_owner_changed(name, old_owner, new_owner)` should trigger a
/// re-registration attempt (SPEC_FULL.md §2.7): only when the *new* owner is
/// non-empty, i.e. the PDP actually (re)appeared rather than vanished.
pub fn should_reregister_on_owner_change(watched_name: &str, changed_name: &str, new_owner: &str) -> bool {
    changed_name == watched_name && !new_owner.is_empty()
}

pub fn route_class_label(class: RouteClass) -> &'static str {
    match class {
        RouteClass::Sink => "sink",
        RouteClass::Source => "source",
    }
}

/// Fixed path the device/media `info` signals are broadcast on, independent
/// of the configured PDP path (spec.md §4.7; matches the original
/// enforcement point's hardcoded `/com/nokia/policy/info`).
pub const INFO_PATH: &str = "/com/nokia/policy/info";

/// Path the `status` ack is sent to: the PDP's own path with a `/decision`
/// child, as the original's `signal_status` builds it.
fn decision_path(pdp_path: &str) -> String {
    format!("{pdp_path}/decision")
}

/// Acknowledge one processed `audio_actions` batch (spec.md §4.7, §6):
/// `txid == 0` means the caller doesn't want a reply, so nothing is sent.
/// Device moves must already be applied by the time this is called
/// (spec.md §5's ordering guarantee).
pub async fn send_status(connection: &zbus::Connection, pdp_path: &str, if_name: &str, txid: u32, ok: bool) -> zbus::Result<()> {
    if txid == 0 {
        info!("txid 0, suppressing status ack");
        return Ok(());
    }
    connection
        .emit_signal(None::<()>, decision_path(pdp_path), if_name, "status", &(txid, ok as u32))
        .await
}

/// Emit a device connect/disconnect `info` signal for a set of
/// device-type labels (spec.md §4.7).
pub async fn send_device_state(connection: &zbus::Connection, if_name: &str, connected: bool, types: &[String]) -> zbus::Result<()> {
    let state = if connected { "1" } else { "0" };
    connection
        .emit_signal(None::<()>, INFO_PATH, if_name, "info", &(state, types))
        .await
}

/// Emit a group media-active/inactive `info` signal (spec.md §4.3
/// `MEDIA_NOTIFY`, §4.7).
pub async fn send_media_status(connection: &zbus::Connection, if_name: &str, media: &str, group: &str, active: bool) -> zbus::Result<()> {
    let state = if active { "active" } else { "inactive" };
    connection
        .emit_signal(None::<()>, INFO_PATH, if_name, "info", &("media", media, group, state))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use zbus::zvariant::{OwnedValue, Value};

    fn args(pairs: &[(&str, Value<'_>)]) -> ActionArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OwnedValue::try_from(v.clone()).unwrap()))
            .collect()
    }

    #[test]
    fn unknown_action_name_is_silently_ignored() {
        let mut batch: ActionBatch = HashMap::new();
        batch.insert("com.nokia.policy.unknown_thing".to_string(), vec![args(&[])]);
        let decoded = decode_batch(&batch).unwrap();
        assert!(decoded.routes.is_empty());
        assert!(decoded.volume_limits.is_empty());
    }

    #[test]
    fn malformed_action_body_fails_whole_batch() {
        let mut batch: ActionBatch = HashMap::new();
        batch.insert(
            ACTION_VOLUME_LIMIT.to_string(),
            vec![args(&[("group", Value::from("G"))])], // missing 'limit'
        );
        assert!(decode_batch(&batch).is_err());
    }

    #[test]
    fn route_decision_overflow_past_batch_budget_is_truncated() {
        let mut batch: ActionBatch = HashMap::new();
        let instance = args(&[("type", Value::from("sink")), ("device", Value::from("a"))]);
        batch.insert(
            ACTION_AUDIO_ROUTE.to_string(),
            vec![instance.clone(), instance.clone(), instance],
        );
        let decoded = decode_batch(&batch).unwrap();
        assert_eq!(decoded.routes.len(), MAX_ROUTE_DECISIONS_PER_BATCH);
    }

    #[test]
    fn reregister_only_fires_on_nonempty_new_owner() {
        assert!(!should_reregister_on_owner_change("com.nokia.policy", "com.nokia.policy", ""));
        assert!(should_reregister_on_owner_change("com.nokia.policy", "com.nokia.policy", ":1.42"));
        assert!(!should_reregister_on_owner_change("com.nokia.policy", "org.other.Name", ":1.42"));
    }

    #[test]
    fn decision_path_appends_decision_child() {
        assert_eq!(decision_path("/com/nokia/policy"), "/com/nokia/policy/decision");
    }

    #[test]
    fn decodes_a_mixed_batch_preserving_each_kind() {
        let mut batch: ActionBatch = HashMap::new();
        batch.insert(
            ACTION_AUDIO_CORK.to_string(),
            vec![args(&[("group", Value::from("music")), ("cork", Value::from("corked"))])],
        );
        batch.insert(
            ACTION_AUDIO_MUTE.to_string(),
            vec![args(&[("device", Value::from("mic")), ("mute", Value::from("muted"))])],
        );
        batch.insert(
            ACTION_CONTEXT.to_string(),
            vec![args(&[("variable", Value::from("V")), ("value", Value::from("on"))])],
        );
        let decoded = decode_batch(&batch).unwrap();
        assert_eq!(decoded.corks.len(), 1);
        assert_eq!(decoded.mutes.len(), 1);
        assert_eq!(decoded.context_sets.len(), 1);
    }
}
