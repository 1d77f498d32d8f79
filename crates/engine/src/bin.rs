// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The decode bin: typefind in front, a tree of processing chains behind,
//! and atomic exposure of every finished branch.
//!
//! ## Locks
//!
//! Three locks live here, never nested in the wrong order:
//! - the *dynamic* lock (`dyn_state`): shutdown flag and the set of
//!   blocked termini. Only ever taken alone.
//! - the *expose* lock: root chain, exposed pads, pad numbering. Chain and
//!   terminus locks may be taken under it.
//! - the stage list lock, a leaf.
//!
//! Termini are unblocked only after the expose lock is released.

use crate::chain::{Chain, PadAnalysis};
use crate::config::DecodeBinConfig;
use crate::constants::exposed_pad_name;
use crate::events::{BinEvent, EventBus};
use crate::finder::CandidateFinder;
use crate::hooks::{AutoplugHooks, DefaultHooks};
use crate::metrics::BinMetrics;
use crate::terminus::TerminusPort;
use crate::typefind::{self, TypeFindStage};
use decodekit_core::{
    Caps, DecodeKitError, Pad, Result, SignalHandle, Stage, StageRegistry, StageState, StateChange,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Guarded by the dynamic lock.
#[derive(Default)]
pub(crate) struct DynState {
    pub shutdown: bool,
    pub blocked: Vec<Weak<TerminusPort>>,
}

#[derive(Default)]
struct ExposeState {
    root: Option<Arc<Chain>>,
    exposed: Vec<Arc<TerminusPort>>,
    next_pad_index: u32,
    no_more_pads_emitted: bool,
    error_posted: bool,
}

pub(crate) struct BinInner {
    name: String,
    pub(crate) config: DecodeBinConfig,
    pub(crate) finder: CandidateFinder,
    pub(crate) hooks: Arc<dyn AutoplugHooks>,
    pub(crate) metrics: BinMetrics,
    events: EventBus,
    typefind: Stage,
    sink_pad: Pad,
    typefind_handles: Mutex<Vec<SignalHandle>>,
    stages: Mutex<Vec<Stage>>,
    pub(crate) dyn_state: Mutex<DynState>,
    shutdown: AtomicBool,
    expose: Mutex<ExposeState>,
    state: Mutex<StageState>,
    next_chain_id: AtomicU32,
    expose_calls: AtomicU32,
    expose_batches: AtomicU32,
}

/// Auto-plugging decoder container.
///
/// Feed bytes into [`sink_pad`](Self::sink_pad); decoded-format streams
/// appear as `src_N` pads, announced through [`subscribe_events`](Self::subscribe_events).
///
/// ```ignore
/// let bin = DecodeBin::new(registry, DecodeBinConfig::default())?;
/// let mut events = bin.subscribe_events();
/// bin.set_state(StageState::Playing)?;
/// upstream.link(&bin.sink_pad())?;
/// ```
pub struct DecodeBin {
    inner: Arc<BinInner>,
}

impl DecodeBin {
    /// Creates a bin plugging from `registry` with default hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(registry: Arc<StageRegistry>, config: DecodeBinConfig) -> Result<Self> {
        Self::with_hooks(registry, config, Arc::new(DefaultHooks))
    }

    /// Creates a bin with application hooks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_hooks(
        registry: Arc<StageRegistry>,
        config: DecodeBinConfig,
        hooks: Arc<dyn AutoplugHooks>,
    ) -> Result<Self> {
        config.validate()?;
        let typefind = typefind::create(Arc::clone(&registry), &config)?;
        let sink_pad = typefind
            .sink_pad()
            .ok_or_else(|| DecodeKitError::Runtime("typefind stage has no sink pad".to_string()))?;

        let inner = Arc::new(BinInner {
            name: "decodebin".to_string(),
            config,
            finder: CandidateFinder::new(registry),
            hooks,
            metrics: BinMetrics::new(),
            events: EventBus::default(),
            typefind,
            sink_pad,
            typefind_handles: Mutex::new(Vec::new()),
            stages: Mutex::new(Vec::new()),
            dyn_state: Mutex::new(DynState::default()),
            shutdown: AtomicBool::new(false),
            expose: Mutex::new(ExposeState::default()),
            state: Mutex::new(StageState::Null),
            next_chain_id: AtomicU32::new(0),
            expose_calls: AtomicU32::new(0),
            expose_batches: AtomicU32::new(0),
        });
        tracing::debug!(bin = %inner.name, "created decode bin");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bin's single input.
    pub fn sink_pad(&self) -> Pad {
        self.inner.sink_pad.clone()
    }

    /// Currently exposed source pads, in exposure order.
    pub fn src_pads(&self) -> Vec<Pad> {
        self.inner.expose.lock().exposed.iter().map(|p| p.ghost().clone()).collect()
    }

    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<BinEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_state(&self) -> StageState {
        *self.inner.state.lock()
    }

    /// Stages plugged by the chains (the typefind stage excluded).
    pub fn stages(&self) -> Vec<Stage> {
        self.inner.stages.lock().clone()
    }

    pub fn typefind(&self) -> &Stage {
        &self.inner.typefind
    }

    /// Exposure attempts so far, successful or not.
    pub fn expose_calls(&self) -> u32 {
        self.inner.expose_calls.load(Ordering::SeqCst)
    }

    /// Exposure batches that published at least one pad.
    pub fn expose_batches(&self) -> u32 {
        self.inner.expose_batches.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn root_chain(&self) -> Option<Arc<Chain>> {
        self.inner.expose.lock().root.clone()
    }

    #[cfg(test)]
    pub(crate) fn try_expose(&self) -> bool {
        self.inner.try_expose()
    }

    #[cfg(test)]
    pub(crate) fn blocked_count(&self) -> usize {
        self.inner.dyn_state.lock().blocked.iter().filter(|p| p.strong_count() > 0).count()
    }

    /// Walks the bin to `target` one transition at a time.
    ///
    /// # Errors
    ///
    /// Returns the first transition error; the bin stays in the last state
    /// reached.
    pub fn set_state(&self, target: StageState) -> Result<()> {
        loop {
            let current = self.current_state();
            let Some(transition) = StateChange::towards(current, target) else {
                return Ok(());
            };
            self.inner.change_state(transition)?;
            *self.inner.state.lock() = transition.next();
            tracing::debug!(bin = %self.inner.name, state = ?transition.next(), "state changed");
        }
    }
}

impl Drop for DecodeBin {
    fn drop(&mut self) {
        self.inner.teardown();
        if let Err(e) = self.inner.typefind.set_state(StageState::Null) {
            tracing::warn!(bin = %self.inner.name, error = %e, "could not stop typefind");
        }
    }
}

impl BinInner {
    fn change_state(self: &Arc<Self>, transition: StateChange) -> Result<()> {
        match transition {
            StateChange::ReadyToPaused => {
                self.reset_for_stream();
                self.connect_typefind();
                self.typefind.set_state(StageState::Paused)
            },
            StateChange::PausedToReady => {
                self.teardown();
                self.typefind.set_state(StageState::Ready)
            },
            other => self.typefind.set_state(other.next()),
        }
    }

    fn reset_for_stream(&self) {
        let mut dyn_state = self.dyn_state.lock();
        dyn_state.shutdown = false;
        dyn_state.blocked.clear();
        self.shutdown.store(false, Ordering::SeqCst);
    }

    fn connect_typefind(self: &Arc<Self>) {
        let Some(imp) = self.typefind.imp::<TypeFindStage>() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let have_type = imp.connect_have_type({
            let weak = weak.clone();
            move |probability, caps| {
                if let Some(bin) = weak.upgrade() {
                    bin.on_have_type(probability, caps);
                }
            }
        });
        let error = imp.connect_error(move |message| {
            if let Some(bin) = weak.upgrade() {
                tracing::error!(bin = %bin.name, %message, "type detection failed");
                bin.post(&BinEvent::Error { message: message.to_string() });
            }
        });
        *self.typefind_handles.lock() = vec![have_type, error];
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn next_chain_id(&self) -> u32 {
        self.next_chain_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn post(&self, event: &BinEvent) {
        self.events.post(event);
    }

    /// Registers a chain-owned stage.
    pub fn add_stage(&self, stage: &Stage) -> Result<()> {
        if self.is_shutting_down() {
            return Err(DecodeKitError::Shutdown);
        }
        self.stages.lock().push(stage.clone());
        Ok(())
    }

    /// Stops, unlinks and forgets a chain-owned stage.
    pub fn discard_stage(&self, stage: &Stage) {
        if let Err(e) = stage.set_state(StageState::Null) {
            tracing::warn!(stage = %stage.name(), error = %e, "could not stop stage");
        }
        for pad in stage.pads() {
            pad.unlink();
        }
        self.stages.lock().retain(|s| s != stage);
        tracing::trace!(stage = %stage.name(), "stage discarded");
    }

    fn on_have_type(self: &Arc<Self>, probability: u32, caps: &Caps) {
        tracing::info!(bin = %self.name, probability, %caps, "type found");
        self.post(&BinEvent::HaveType { probability, caps: caps.clone() });

        let Some(src) = self.typefind.static_pad("src") else {
            tracing::error!(bin = %self.name, "typefind stage has no src pad");
            return;
        };
        let _stream = self.sink_pad.stream_lock();
        if self.is_shutting_down() {
            return;
        }
        let root = {
            let mut expose = self.expose.lock();
            if self.is_shutting_down() {
                return;
            }
            if expose.root.is_some() {
                tracing::warn!(bin = %self.name, "type found twice for one stream, ignoring");
                return;
            }
            let root = Chain::new(self, None, &src, Some(caps.clone()));
            expose.root = Some(Arc::clone(&root));
            root
        };
        Chain::run_analysis(PadAnalysis {
            chain: root,
            stage: Some(self.typefind.clone()),
            pad: src,
            caps: Some(caps.clone()),
        });
    }

    /// Exposes every finished branch if the whole tree is complete.
    ///
    /// Returns whether the tree is (now) fully exposed.
    pub fn try_expose(&self) -> bool {
        self.expose_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_shutting_down() {
            return false;
        }

        let mut added: Vec<(Pad, Option<Caps>)> = Vec::new();
        let endpoints = {
            let mut expose = self.expose.lock();
            let Some(root) = expose.root.clone() else {
                return false;
            };
            if !root.is_complete() {
                tracing::trace!(bin = %self.name, "tree not complete yet");
                return false;
            }

            let mut endpoints = Vec::new();
            let mut missing = Vec::new();
            if !root.collect_endpoints(&mut endpoints, &mut missing) {
                return false;
            }

            if endpoints.is_empty() {
                if !missing.is_empty() && !expose.error_posted {
                    expose.error_posted = true;
                    let message = format!("no suitable plugins found: {}", missing.join(", "));
                    tracing::error!(bin = %self.name, %message, "nothing to expose");
                    self.post(&BinEvent::Error { message });
                }
                return false;
            }

            if endpoints.iter().all(|p| p.is_exposed()) {
                return true;
            }

            endpoints.sort_by(|a, b| {
                exposure_rank(a.caps().as_ref())
                    .cmp(&exposure_rank(b.caps().as_ref()))
                    .then_with(|| a.stream_id().cmp(&b.stream_id()))
            });

            for port in &endpoints {
                if port.is_exposed() {
                    continue;
                }
                let name = exposed_pad_name(expose.next_pad_index);
                port.set_exposed(true);
                if !port.ghost().is_active()
                    || expose.exposed.iter().any(|p| p.ghost().name() == name)
                {
                    tracing::warn!(bin = %self.name, pad = %name, "could not expose pad");
                    port.set_exposed(false);
                    continue;
                }
                expose.next_pad_index += 1;
                port.ghost().set_name(name);
                expose.exposed.push(Arc::clone(port));
                self.hooks.pad_added(port.ghost());
                let caps = port.caps();
                self.post(&BinEvent::PadAdded { pad: port.ghost().clone(), caps: caps.clone() });
                added.push((port.ghost().clone(), caps));
            }

            if !expose.no_more_pads_emitted {
                expose.no_more_pads_emitted = true;
                self.post(&BinEvent::NoMorePads);
            }
            endpoints
        };

        for port in &endpoints {
            port.set_blocked(false);
        }

        if !added.is_empty() {
            self.expose_batches.fetch_add(1, Ordering::SeqCst);
            self.metrics.pads_exposed(added.len() as u64);
            for (pad, caps) in &added {
                let caps = caps.as_ref().map_or_else(|| "unknown".to_string(), ToString::to_string);
                tracing::info!(
                    bin = %self.name,
                    pad = %pad.name(),
                    %caps,
                    "exposed pad"
                );
            }
        }
        true
    }

    /// Withdraws an exposed terminus.
    pub fn unexpose(&self, port: &Arc<TerminusPort>) {
        let removed = {
            let mut expose = self.expose.lock();
            let before = expose.exposed.len();
            expose.exposed.retain(|p| !Arc::ptr_eq(p, port));
            expose.exposed.len() != before
        };
        if removed {
            port.ghost().set_active(false);
            tracing::info!(bin = %self.name, pad = %port.ghost().name(), "removed pad");
            self.post(&BinEvent::PadRemoved { pad: port.ghost().clone() });
        }
    }

    /// Releases every blocked thread and frees the chain tree.
    fn teardown(&self) {
        self.typefind_handles.lock().clear();

        let blocked = {
            let mut dyn_state = self.dyn_state.lock();
            dyn_state.shutdown = true;
            self.shutdown.store(true, Ordering::SeqCst);
            std::mem::take(&mut dyn_state.blocked)
        };
        for port in blocked.iter().filter_map(Weak::upgrade) {
            port.set_blocked(false);
        }

        let root = self.expose.lock().root.take();
        if let Some(root) = root {
            root.free();
        }

        let leftover = {
            let mut expose = self.expose.lock();
            expose.next_pad_index = 0;
            expose.no_more_pads_emitted = false;
            expose.error_posted = false;
            std::mem::take(&mut expose.exposed)
        };
        for port in leftover {
            port.set_exposed(false);
            port.ghost().set_active(false);
            self.post(&BinEvent::PadRemoved { pad: port.ghost().clone() });
        }

        let stages = std::mem::take(&mut *self.stages.lock());
        for stage in &stages {
            if let Err(e) = stage.set_state(StageState::Null) {
                tracing::warn!(stage = %stage.name(), error = %e, "could not stop stage");
            }
            for pad in stage.pads() {
                pad.unlink();
            }
        }
        tracing::debug!(bin = %self.name, stages = stages.len(), "torn down");
    }
}

/// Exposure order: raw video, other video and images, raw audio, other
/// audio, everything else.
fn exposure_rank(caps: Option<&Caps>) -> u8 {
    let Some(media) = caps.and_then(Caps::media_type) else {
        return 4;
    };
    if media == "video/x-raw" {
        0
    } else if media.starts_with("video/") || media.starts_with("image/") {
        1
    } else if media == "audio/x-raw" {
        2
    } else if media.starts_with("audio/") {
        3
    } else {
        4
    }
}
