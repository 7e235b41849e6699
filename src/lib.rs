// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `policyd` - the core policy engine of an audio-routing enforcement
//! plugin: a rule-driven classifier, grouping, and action-dispatch layer
//! for a host audio server, driven by declarative configuration and a
//! remote policy decision point (PDP).
//!
//! This crate is split the way the engine's own design notes ask for it to
//! be: every module below is pure logic plus a [`host::HostAdapter`]
//! parameter, so the whole policy pipeline can be exercised without a live
//! PipeWire/PulseAudio connection. [`engine::Engine`] is the one place that
//! wires them together into the call order spec'd for stream-new,
//! stream-removed, PDP-action dispatch, and config (re)load.

pub mod classify;
pub mod config;
pub mod context;
pub mod engine;
pub mod group;
pub mod host;
pub mod match_expr;
pub mod pdp;
pub mod registry;
pub mod routing;
