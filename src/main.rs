// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `policyd` binary entrypoint: CLI parsing, config load, D-Bus PDP
//! registration/dispatch loop, and graceful shutdown.
//!
//! The audio server itself is out of scope (spec.md §1) - this binary
//! wires the engine up to a [`policyd::host::NullHostAdapter`] so it links
//! and runs end-to-end against the PDP/config surface; a production
//! deployment swaps that adapter for a live PipeWire/PulseAudio binding
//! behind the same [`policyd::host::HostAdapter`] trait.

use clap::Parser;
use futures::StreamExt;
use policy_ipc::{DEFAULT_DBUS_IF_NAME, DEFAULT_MY_NAME, DEFAULT_MY_PATH, DEFAULT_POLICYD_PATH};
use policyd::classify::PidOverride;
use policyd::config::ConfigManager;
use policyd::engine::Engine;
use policyd::host::NullHostAdapter;
use policyd::match_expr::MatchExpr;
use policyd::pdp::{self, PdpEventsProxy};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// The signals this daemon asks the PDP to deliver once registered
/// (spec.md §5).
const SUBSCRIBED_SIGNALS: &[&str] = &["stream_info", "audio_actions"];

#[derive(Debug, Parser)]
#[command(name = "policyd", version, about = "Audio-routing policy enforcement daemon")]
struct PolicydArgs {
    /// Primary configuration file.
    #[arg(long, default_value = "/etc/policyd/policy.conf")]
    config_file: PathBuf,

    /// Optional directory of `*.conf`/`*.conf.override` overlays.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// D-Bus interface name the PDP contract is carried on.
    #[arg(long, default_value = DEFAULT_DBUS_IF_NAME)]
    dbus_if_name: String,

    /// Object path this daemon registers itself at.
    #[arg(long, default_value = DEFAULT_MY_PATH)]
    dbus_my_path: String,

    /// Object path the PDP itself lives at.
    #[arg(long, default_value = DEFAULT_POLICYD_PATH)]
    dbus_policyd_path: String,

    /// Well-known bus name this daemon claims and registers under.
    #[arg(long, default_value = DEFAULT_MY_NAME)]
    dbus_policyd_name: String,

    /// Name of the configured null sink used by mute-by-route (spec.md §4.4).
    #[arg(long)]
    null_sink_name: Option<String>,

    /// Claim the well-known bus name even if another owner already holds it.
    #[arg(long)]
    preempt: bool,
}

/// The three kinds of inbound event this daemon reacts to once registered.
enum Event {
    StreamInfo {
        pid: u32,
        group: String,
        stream_hint: String,
        property: String,
    },
    AudioActions {
        txid: u32,
        actions: policy_ipc::ActionBatch,
    },
    PdpOwnerChanged {
        name: String,
        new_owner: String,
    },
}

#[tokio::main]
async fn main() {
    let args = PolicydArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("policyd=info,zbus=warn")),
        )
        .init();

    info!("policyd starting, config file {}", args.config_file.display());

    let manager = ConfigManager::new(args.config_file.clone(), args.config_dir.clone());
    let parsed = match manager.load() {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut engine = Engine::new();
    engine.install_config(parsed);

    let null_sink_index = args.null_sink_name.as_deref().and_then(|name| name.parse::<u32>().ok());
    let host = NullHostAdapter::new(null_sink_index);

    let engine = Arc::new(Mutex::new(engine));
    let host = Arc::new(Mutex::new(host));

    let connection = match zbus::Connection::session().await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to connect to the session bus: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = pdp::register_with_pdp(
        &connection,
        &args.dbus_policyd_name,
        &args.dbus_policyd_path,
        &args.dbus_my_path,
        SUBSCRIBED_SIGNALS,
    )
    .await
    {
        warn!("initial PDP registration did not succeed, will keep serving and retry on owner changes: {e}");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut have_sources = false;

    match PdpEventsProxy::builder(&connection)
        .destination(args.dbus_policyd_name.clone())
        .and_then(|b| b.path(args.dbus_policyd_path.clone()))
    {
        Ok(builder) => match builder.build().await {
            Ok(proxy) => {
                have_sources = true;
                spawn_stream_info_forwarder(proxy.clone(), tx.clone());
                spawn_audio_actions_forwarder(proxy, tx.clone());
            }
            Err(e) => error!("failed to build the PDP events proxy: {e}"),
        },
        Err(e) => error!("failed to configure the PDP events proxy: {e}"),
    }

    match zbus::fdo::DBusProxy::new(&connection).await {
        Ok(dbus_proxy) => {
            have_sources = true;
            spawn_owner_change_forwarder(dbus_proxy, tx.clone());
        }
        Err(e) => warn!("could not build the bus-owner-change watcher: {e}"),
    }
    drop(tx);

    if !have_sources {
        warn!("no PDP event sources available; idling until shutdown");
        shutdown_signal().await;
        info!("policyd stopped");
        return;
    }

    let mut shutdown = Box::pin(shutdown_signal());

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    warn!("all PDP event sources closed; idling until shutdown");
                    shutdown.await;
                    break;
                };
                handle_event(
                    event,
                    &engine,
                    &host,
                    &connection,
                    &args.dbus_policyd_name,
                    &args.dbus_policyd_path,
                    &args.dbus_my_path,
                    &args.dbus_if_name,
                )
                .await;
            }
            _ = &mut shutdown => {
                info!("shutdown requested, stopping");
                break;
            }
        }
    }

    info!("policyd stopped");
}

fn spawn_stream_info_forwarder(proxy: PdpEventsProxy<'static>, tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let Ok(mut stream) = proxy.receive_stream_info().await else {
            warn!("could not subscribe to stream_info signals");
            return;
        };
        while let Some(signal) = stream.next().await {
            if let Ok(a) = signal.args() {
                let event = Event::StreamInfo {
                    pid: a.pid,
                    group: a.group,
                    stream_hint: a.stream_hint,
                    property: a.property,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });
}

fn spawn_audio_actions_forwarder(proxy: PdpEventsProxy<'static>, tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let Ok(mut stream) = proxy.receive_audio_actions().await else {
            warn!("could not subscribe to audio_actions signals");
            return;
        };
        while let Some(signal) = stream.next().await {
            if let Ok(a) = signal.args() {
                let event = Event::AudioActions {
                    txid: a.txid,
                    actions: a.actions,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });
}

fn spawn_owner_change_forwarder(dbus_proxy: zbus::fdo::DBusProxy<'static>, tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let Ok(mut stream) = dbus_proxy.receive_name_owner_changed().await else {
            warn!("could not subscribe to NameOwnerChanged signals");
            return;
        };
        while let Some(signal) = stream.next().await {
            if let Ok(a) = signal.args() {
                let event = Event::PdpOwnerChanged {
                    name: a.name.to_string(),
                    new_owner: a.new_owner.as_ref().map(|o| o.to_string()).unwrap_or_default(),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });
}

async fn handle_event(
    event: Event,
    engine: &Arc<Mutex<Engine>>,
    host: &Arc<Mutex<NullHostAdapter>>,
    connection: &zbus::Connection,
    dbus_policyd_name: &str,
    dbus_policyd_path: &str,
    dbus_my_path: &str,
    dbus_if_name: &str,
) {
    match event {
        Event::StreamInfo { pid, group, stream_hint, property } => {
            let mut engine = engine.lock().await;
            engine.register_pid_override(PidOverride {
                pid,
                stream_name: (!stream_hint.is_empty()).then_some(stream_hint),
                property,
                match_expr: MatchExpr::Equals(group.clone()),
                group_name: group.clone(),
            });
            info!("stream_info: registered pid override for pid {pid} -> group {group}");
        }
        Event::AudioActions { txid, actions } => {
            // Device moves must land before the status ack is sent (spec.md §5).
            let ok = match pdp::decode_batch(&actions) {
                Ok(decoded) => {
                    let real_ratios: HashMap<u32, Vec<f64>> = HashMap::new();
                    let mut engine = engine.lock().await;
                    let mut host = host.lock().await;
                    let ok = engine.dispatch_batch(&mut *host, &real_ratios, &decoded);
                    info!("dispatched audio_actions batch (txid {txid}), ok={ok}");
                    ok
                }
                Err(e) => {
                    warn!("malformed audio_actions batch (txid {txid}): {e}");
                    false
                }
            };
            if let Err(e) = pdp::send_status(connection, dbus_policyd_path, dbus_if_name, txid, ok).await {
                warn!("failed to send status ack for txid {txid}: {e}");
            }
        }
        Event::PdpOwnerChanged { name, new_owner } => {
            if pdp::should_reregister_on_owner_change(dbus_policyd_name, &name, &new_owner) {
                info!("PDP reappeared as {new_owner}, re-registering");
                if let Err(e) =
                    pdp::register_with_pdp(connection, dbus_policyd_name, dbus_policyd_path, dbus_my_path, SUBSCRIBED_SIGNALS)
                        .await
                {
                    warn!("re-registration failed: {e}");
                }
            }
        }
    }
}

/// Resolve on the first of SIGTERM/SIGINT (grounded on the teacher's own
/// `main.rs` shutdown pattern).
async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
