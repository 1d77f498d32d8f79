// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Processing chains and pad analysis.
//!
//! A [`Chain`] is an unbroken run of stages from one branch point to the next
//! branch point (a demuxer, whose streams become child chains) or to a leaf
//! (its terminus port). Chains form a tree owned by the bin: parents own
//! their children, every back-reference is weak.
//!
//! ## Pad analysis
//!
//! Every new source pad is analysed: classify its caps, then either expose
//! it, wait for its caps to become fixed, give up (dead chain), or try the
//! finder's candidates one by one until one attaches. Pads of a freshly
//! attached stage are pushed on a work queue instead of recursing, so no
//! chain lock is ever taken twice on one call stack.
//!
//! ## Locking
//!
//! A chain's lock only guards its own bookkeeping. It is never held while
//! calling into stages, pads or the bin, and never together with another
//! chain's lock.

use crate::bin::BinInner;
use crate::capsfilter::{self, CapsFilter};
use crate::events::BinEvent;
use crate::hooks::AutoplugSelect;
use crate::terminus::TerminusPort;
use decodekit_core::pad::ProbeData;
use decodekit_core::{
    Caps, DecodeKitError, Event, Pad, PadDirection, ProbeHandle, ProbeMask, ProbeReturn,
    SignalHandle, Stage, StageFactory, StageState, WeakPad, WeakStage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// One unit of work: analyse `pad` (produced by `stage`) on `chain`.
pub(crate) struct PadAnalysis {
    pub chain: Arc<Chain>,
    pub stage: Option<Stage>,
    pub pad: Pad,
    pub caps: Option<Caps>,
}

/// An attached stage plus what the chain registered on it.
struct StageEntry {
    stage: Stage,
    capsfilter: Option<Stage>,
    signals: Vec<SignalHandle>,
}

/// A pad whose caps are not fixed yet.
struct PendingPort {
    pad: WeakPad,
    _eos_probe: ProbeHandle,
    _caps_notify: SignalHandle,
}

enum Outcome {
    Unknown(String),
    Defer,
    Expose,
    Continue(Vec<Arc<StageFactory>>),
}

enum Connect {
    /// A stage was attached; its pads carry the analysis on.
    Attached,
    /// This pad ends the chain.
    Terminus,
    /// Every candidate failed.
    Failed(String),
    /// The bin is shutting down or the chain was freed.
    Aborted,
}

#[derive(Default)]
struct ChainState {
    end_caps: Option<Caps>,
    /// Most recently attached first.
    stages: VecDeque<StageEntry>,
    current_port: Option<Arc<TerminusPort>>,
    terminus: Option<Arc<TerminusPort>>,
    pending: Vec<PendingPort>,
    children: Vec<Arc<Chain>>,
    is_demuxer: bool,
    has_parser: bool,
    no_more_pads: bool,
    dead: bool,
    dead_caps: Option<Caps>,
    dead_detail: Option<String>,
    /// Pad analyses queued or running for this chain.
    queued: usize,
    freed: bool,
}

pub(crate) struct Chain {
    id: u32,
    bin: Weak<BinInner>,
    parent: Weak<Chain>,
    start_pad: WeakPad,
    start_caps: Option<Caps>,
    state: Mutex<ChainState>,
}

impl Chain {
    pub fn new(
        bin: &Arc<BinInner>,
        parent: Option<&Arc<Self>>,
        start_pad: &Pad,
        start_caps: Option<Caps>,
    ) -> Arc<Self> {
        let id = bin.next_chain_id();
        bin.metrics.chain_created();
        tracing::debug!(
            chain = id,
            parent = parent.map(|p| p.id),
            pad = %start_pad.name(),
            "created chain"
        );
        Arc::new(Self {
            id,
            bin: Arc::downgrade(bin),
            parent: parent.map_or_else(Weak::new, Arc::downgrade),
            start_pad: start_pad.downgrade(),
            start_caps,
            state: Mutex::new(ChainState::default()),
        })
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn start_caps(&self) -> Option<&Caps> {
        self.start_caps.as_ref()
    }

    pub fn start_pad(&self) -> Option<Pad> {
        self.start_pad.upgrade()
    }

    pub fn end_caps(&self) -> Option<Caps> {
        self.state.lock().end_caps.clone()
    }

    pub fn children(&self) -> Vec<Arc<Self>> {
        self.state.lock().children.clone()
    }

    /// Factory names of the attached stages, most recent first.
    pub fn stage_names(&self) -> Vec<String> {
        self.state.lock().stages.iter().map(|e| e.stage.factory_name().to_string()).collect()
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    pub fn terminus(&self) -> Option<Arc<TerminusPort>> {
        self.state.lock().terminus.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn bin(&self) -> Option<Arc<BinInner>> {
        self.bin.upgrade()
    }

    /// Runs `first` and everything it enqueues.
    pub fn run_analysis(first: PadAnalysis) {
        let mut queue = VecDeque::new();
        Self::enqueue(&mut queue, first);
        while let Some(item) = queue.pop_front() {
            let chain = Arc::clone(&item.chain);
            chain.analyze_pad(item, &mut queue);
            let mut state = chain.state.lock();
            state.queued = state.queued.saturating_sub(1);
        }
    }

    fn enqueue(queue: &mut VecDeque<PadAnalysis>, item: PadAnalysis) {
        item.chain.state.lock().queued += 1;
        queue.push_back(item);
    }

    fn analyze_pad(self: &Arc<Self>, item: PadAnalysis, queue: &mut VecDeque<PadAnalysis>) {
        let Some(bin) = self.bin() else {
            return;
        };
        if bin.is_shutting_down() {
            tracing::debug!(chain = self.id, "shutting down, analysis abandoned");
            return;
        }
        let PadAnalysis { stage: mut src_stage, mut pad, caps, .. } = item;

        let port = {
            let mut state = self.state.lock();
            if state.freed || state.dead || state.terminus.is_some() {
                return;
            }
            if let Some(front) = state.stages.front() {
                let from_front = src_stage
                    .as_ref()
                    .is_some_and(|s| *s == front.stage || front.capsfilter.as_ref() == Some(s));
                if !from_front {
                    let err = DecodeKitError::StructuralViolation(format!(
                        "pad {} does not belong to {}",
                        pad.name(),
                        front.stage.name()
                    ));
                    tracing::error!(chain = self.id, error = %err, "pad analysis aborted");
                    return;
                }
                if state.is_demuxer {
                    let child = Self::new(&bin, Some(self), &pad, caps.clone());
                    state.children.push(Arc::clone(&child));
                    drop(state);
                    Self::enqueue(queue, PadAnalysis { chain: child, stage: src_stage, pad, caps });
                    return;
                }
            }
            Arc::clone(state.current_port.get_or_insert_with(|| TerminusPort::new(&bin, self)))
        };
        port.retarget(Some(&pad));

        let mut caps = caps.or_else(|| pad.current_caps()).unwrap_or_else(|| pad.query_caps(None));
        tracing::debug!(chain = self.id, pad = %pad.name(), %caps, "analysing pad");
        let mut outcome = Self::classify(&bin, src_stage.as_ref(), &pad, &caps);

        let needs_filter = !caps.is_fixed()
            && src_stage.as_ref().is_some_and(|s| s.klass().is_parser_converter())
            && !self.front_has_capsfilter();
        let inserted = match (&outcome, &src_stage) {
            (Outcome::Continue(factories), Some(producer)) if needs_filter => {
                port.retarget(None);
                Some(self.insert_capsfilter(&bin, producer, &pad, &caps, factories))
            },
            _ => None,
        };
        match inserted {
            Some(Ok((filter_stage, filter_src))) => {
                port.retarget(Some(&filter_src));
                caps = filter_src.current_caps().unwrap_or_else(|| filter_src.query_caps(None));
                tracing::debug!(chain = self.id, %caps, "capsfilter inserted");
                pad = filter_src;
                src_stage = Some(filter_stage);
                outcome = Self::classify(&bin, src_stage.as_ref(), &pad, &caps);
            },
            Some(Err(e)) => outcome = Outcome::Unknown(e.to_string()),
            None => {},
        }

        match outcome {
            Outcome::Continue(factories) => {
                match self.connect_pad(&bin, &port, &pad, &caps, &factories, queue) {
                    Connect::Attached | Connect::Aborted => {},
                    Connect::Terminus => self.set_terminus(&port, &caps),
                    Connect::Failed(detail) => self.mark_dead(&bin, &caps, detail),
                }
            },
            Outcome::Expose => self.set_terminus(&port, &caps),
            Outcome::Defer => self.defer_pad(src_stage.as_ref(), &pad),
            Outcome::Unknown(detail) => self.mark_dead(&bin, &caps, detail),
        }
    }

    fn classify(bin: &BinInner, src_stage: Option<&Stage>, pad: &Pad, caps: &Caps) -> Outcome {
        if caps.is_empty() {
            return Outcome::Unknown("stream has no caps".to_string());
        }
        if caps.is_any() {
            return Outcome::Defer;
        }
        if caps.is_fixed() {
            if !bin.hooks.autoplug_continue(pad, caps, &bin.config.raw_caps) {
                tracing::debug!(%caps, "auto-plugging stopped, exposing");
                return Outcome::Expose;
            }
        } else if !src_stage.is_some_and(tolerates_unfixed_caps) {
            return Outcome::Defer;
        }

        let factories = bin.finder.find(caps);
        if factories.is_empty() {
            return Outcome::Unknown(format!("no decoder or parser available for {caps}"));
        }
        Outcome::Continue(factories)
    }

    fn front_has_capsfilter(&self) -> bool {
        self.state.lock().stages.front().is_some_and(|e| e.capsfilter.is_some())
    }

    /// Links a capsfilter behind a parser-converter so its output narrows to
    /// what the remaining candidates accept.
    fn insert_capsfilter(
        &self,
        bin: &BinInner,
        producer: &Stage,
        pad: &Pad,
        caps: &Caps,
        factories: &[Arc<StageFactory>],
    ) -> Result<(Stage, Pad), DecodeKitError> {
        let mut filter = Caps::new_empty();
        for factory in factories {
            if factory.klass().is_parser() || Arc::ptr_eq(factory, producer.factory()) {
                continue;
            }
            for template in factory.sink_templates() {
                filter.merge(template.caps.clone());
            }
        }
        if filter.is_empty() {
            return Err(DecodeKitError::UnsupportedType(format!(
                "nothing downstream of {} to constrain its output",
                producer.name()
            )));
        }
        // Keep formats only a later stage might take.
        filter.merge(caps.clone());

        let stage = capsfilter::create(&filter)?;
        stage.set_locked_state(true);
        bin.add_stage(&stage)?;
        let (Some(sink), Some(src)) = (stage.sink_pad(), stage.static_pad("src")) else {
            bin.discard_stage(&stage);
            return Err(DecodeKitError::Attachment("capsfilter has no pads".to_string()));
        };
        if let Err(e) = Pad::link(pad, &sink) {
            bin.discard_stage(&stage);
            return Err(e.into());
        }
        let playing = {
            let _stream = pad.stream_lock();
            let result = stage.set_state(StageState::Playing);
            if result.is_ok() {
                pad.push_sticky_events();
            }
            result
        };
        if let Err(e) = playing {
            bin.discard_stage(&stage);
            return Err(e);
        }

        if let Some(front) = self.state.lock().stages.front_mut() {
            front.capsfilter = Some(stage.clone());
        }
        debug_assert!(stage.imp::<CapsFilter>().is_some());
        Ok((stage, src))
    }

    /// The candidate attachment loop.
    fn connect_pad(
        self: &Arc<Self>,
        bin: &Arc<BinInner>,
        port: &Arc<TerminusPort>,
        pad: &Pad,
        caps: &Caps,
        factories: &[Arc<StageFactory>],
        queue: &mut VecDeque<PadAnalysis>,
    ) -> Connect {
        let base_len = self.state.lock().stages.len();
        let mut diagnostics: Vec<String> = Vec::new();

        for factory in factories {
            if bin.is_shutting_down() {
                return Connect::Aborted;
            }
            port.retarget(Some(pad));

            match bin.hooks.autoplug_select(pad, caps, factory) {
                AutoplugSelect::Try => {},
                AutoplugSelect::Skip => {
                    diagnostics.push(format!("{}: skipped by application", factory.name()));
                    continue;
                },
                AutoplugSelect::Expose => return Connect::Terminus,
            }
            bin.metrics.candidate_tried(factory.name());

            if caps.is_fixed() && !factory.can_sink_all_caps(caps) {
                tracing::debug!(
                    factory = %factory.name(),
                    %caps,
                    "sink template cannot accept caps"
                );
                bin.metrics.candidate_rejected(factory.name(), "caps");
                diagnostics.push(format!("{}: cannot accept {caps}", factory.name()));
                continue;
            }

            if factory.klass().is_decoder() {
                tracing::debug!(
                    chain = self.id,
                    factory = %factory.name(),
                    "decoder found, pad is terminus"
                );
                return Connect::Terminus;
            }

            if factory.klass().is_parser() && self.would_cycle(factory) {
                let err = DecodeKitError::CycleDetected(format!(
                    "{} already parses this stream",
                    factory.name()
                ));
                tracing::debug!(chain = self.id, error = %err, "candidate skipped");
                bin.metrics.candidate_rejected(factory.name(), "cycle");
                diagnostics.push(err.to_string());
                continue;
            }

            port.retarget(None);
            let stage = match Self::try_attach(bin, factory, pad, caps) {
                Ok(stage) => stage,
                Err(e) => {
                    tracing::warn!(
                        chain = self.id,
                        factory = %factory.name(),
                        error = %e,
                        "candidate rolled back"
                    );
                    bin.metrics.candidate_rejected(factory.name(), "attach");
                    diagnostics.push(e.to_string());
                    continue;
                },
            };

            let dynamic = factory.has_dynamic_src_pads();
            let static_pads = stage.src_pads();
            let signals = if dynamic { self.connect_dynamic_signals(&stage) } else { Vec::new() };
            {
                let mut state = self.state.lock();
                if state.freed {
                    drop(state);
                    bin.discard_stage(&stage);
                    return Connect::Aborted;
                }
                state.stages.push_front(StageEntry {
                    stage: stage.clone(),
                    capsfilter: None,
                    signals,
                });
                state.is_demuxer = factory.klass().is_demuxer();
                if state.is_demuxer {
                    state.no_more_pads = !dynamic;
                }
                state.has_parser |= factory.klass().is_parser();
            }

            let playing = {
                let _stream = pad.stream_lock();
                let result = stage.set_state(StageState::Playing);
                if result.is_ok() {
                    pad.push_sticky_events();
                }
                result
            };
            if let Err(e) = playing {
                tracing::warn!(
                    chain = self.id,
                    factory = %factory.name(),
                    error = %e,
                    "could not start candidate, unwinding"
                );
                self.unwind(bin, base_len);
                bin.metrics.candidate_rejected(factory.name(), "state");
                diagnostics.push(e.to_string());
                continue;
            }

            tracing::info!(chain = self.id, stage = %stage.name(), %caps, "attached stage");
            for src in static_pads {
                let caps = src.current_caps();
                Self::enqueue(
                    queue,
                    PadAnalysis {
                        chain: Arc::clone(self),
                        stage: Some(stage.clone()),
                        pad: src,
                        caps,
                    },
                );
            }
            return Connect::Attached;
        }

        Connect::Failed(if diagnostics.is_empty() {
            format!("no candidate could handle {caps}")
        } else {
            diagnostics.join("; ")
        })
    }

    /// Instantiate, add, link, READY, accept-caps. Rolls back on failure.
    fn try_attach(
        bin: &BinInner,
        factory: &Arc<StageFactory>,
        pad: &Pad,
        caps: &Caps,
    ) -> Result<Stage, DecodeKitError> {
        let stage = factory.create(None)?;
        stage.set_locked_state(true);
        bin.add_stage(&stage)?;

        let Some(sink) = stage.sink_pad() else {
            bin.discard_stage(&stage);
            return Err(DecodeKitError::Attachment(format!("{} has no sink pad", stage.name())));
        };
        if let Err(e) = Pad::link(pad, &sink) {
            bin.discard_stage(&stage);
            return Err(DecodeKitError::Attachment(format!(
                "could not link {} to {}: {e}",
                pad.name(),
                stage.name()
            )));
        }
        if let Err(e) = stage.set_state(StageState::Ready) {
            bin.discard_stage(&stage);
            return Err(e);
        }
        if !sink.query_accept_caps(caps) {
            bin.discard_stage(&stage);
            return Err(DecodeKitError::Attachment(format!("{} refused caps {caps}", stage.name())));
        }
        Ok(stage)
    }

    fn factory_names(&self) -> Vec<String> {
        self.state.lock().stages.iter().map(|e| e.stage.factory_name().to_string()).collect()
    }

    /// A parser must not be plugged behind itself, in this chain or its
    /// parent.
    fn would_cycle(&self, factory: &StageFactory) -> bool {
        let name = factory.name();
        if self.factory_names().iter().any(|n| n == name) {
            return true;
        }
        self.parent.upgrade().is_some_and(|p| p.factory_names().iter().any(|n| n == name))
    }

    fn connect_dynamic_signals(self: &Arc<Self>, stage: &Stage) -> Vec<SignalHandle> {
        let weak = Arc::downgrade(self);
        let added = stage.connect_pad_added({
            let weak = weak.clone();
            move |stage, pad| {
                if pad.direction() != PadDirection::Src {
                    return;
                }
                if let Some(chain) = weak.upgrade() {
                    tracing::debug!(
                        chain = chain.id,
                        stage = %stage.name(),
                        pad = %pad.name(),
                        "new pad"
                    );
                    Self::run_analysis(PadAnalysis {
                        chain,
                        stage: Some(stage.clone()),
                        pad: pad.clone(),
                        caps: pad.current_caps(),
                    });
                }
            }
        });
        let removed = stage.connect_pad_removed({
            let weak = weak.clone();
            move |stage, pad| {
                if let Some(chain) = weak.upgrade() {
                    chain.on_pad_removed(stage, pad);
                }
            }
        });
        let no_more = stage.connect_no_more_pads(move |stage| {
            if let Some(chain) = weak.upgrade() {
                chain.on_no_more_pads(stage);
            }
        });
        vec![added, removed, no_more]
    }

    /// Pops every stage attached after `base_len` and discards it.
    fn unwind(&self, bin: &BinInner, base_len: usize) {
        let (removed, children) = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            while state.stages.len() > base_len {
                if let Some(entry) = state.stages.pop_front() {
                    removed.push(entry);
                }
            }
            state.is_demuxer = state.stages.front().is_some_and(|e| e.stage.klass().is_demuxer());
            state.has_parser = state.stages.iter().any(|e| e.stage.klass().is_parser());
            let children = if state.is_demuxer {
                Vec::new()
            } else {
                state.no_more_pads = false;
                std::mem::take(&mut state.children)
            };
            (removed, children)
        };

        for child in children {
            child.free();
        }
        for entry in removed {
            tracing::debug!(chain = self.id, stage = %entry.stage.name(), "unwinding stage");
            drop(entry.signals);
            if let Some(filter) = entry.capsfilter {
                bin.discard_stage(&filter);
            }
            bin.discard_stage(&entry.stage);
        }
    }

    fn set_terminus(self: &Arc<Self>, port: &Arc<TerminusPort>, caps: &Caps) {
        {
            let mut state = self.state.lock();
            if state.terminus.is_some() || state.freed {
                return;
            }
            state.terminus = Some(Arc::clone(port));
            state.end_caps = Some(caps.clone());
        }
        tracing::debug!(chain = self.id, %caps, "chain reached terminus");
        port.mark_active(self);
    }

    fn defer_pad(self: &Arc<Self>, src_stage: Option<&Stage>, pad: &Pad) {
        let weak = Arc::downgrade(self);
        let producer = src_stage.map(Stage::downgrade);

        let eos_probe = pad.add_probe(ProbeMask::EVENT_DOWNSTREAM, {
            let weak = weak.clone();
            let producer = producer.clone();
            move |pad, info| {
                if matches!(info.data, ProbeData::Event(Event::Eos)) {
                    if let Some(chain) = weak.upgrade() {
                        chain.on_pending_eos(producer.as_ref().and_then(WeakStage::upgrade), pad);
                    }
                }
                ProbeReturn::Ok
            }
        });
        let caps_notify = pad.connect_caps_notify({
            let weak = weak.clone();
            let producer = producer.clone();
            let pad = pad.downgrade();
            move |caps| {
                if !caps.is_fixed() {
                    return;
                }
                if let (Some(chain), Some(pad)) = (weak.upgrade(), pad.upgrade()) {
                    let producer = producer.as_ref().and_then(WeakStage::upgrade);
                    chain.on_pending_caps(producer, &pad, caps);
                }
            }
        });

        {
            let mut state = self.state.lock();
            if state.freed {
                return;
            }
            state.pending.push(PendingPort {
                pad: pad.downgrade(),
                _eos_probe: eos_probe,
                _caps_notify: caps_notify,
            });
        }
        tracing::debug!(chain = self.id, pad = %pad.name(), "caps not fixed yet, waiting");

        // Caps may have been fixed while the watches were installed.
        if let Some(caps) = pad.current_caps().filter(Caps::is_fixed) {
            self.on_pending_caps(producer.as_ref().and_then(WeakStage::upgrade), pad, &caps);
        }
    }

    fn take_pending(&self, pad: &Pad) -> Option<PendingPort> {
        let mut state = self.state.lock();
        let index = state.pending.iter().position(|p| p.pad.upgrade().as_ref() == Some(pad))?;
        Some(state.pending.swap_remove(index))
    }

    fn on_pending_caps(self: &Arc<Self>, stage: Option<Stage>, pad: &Pad, caps: &Caps) {
        let Some(pending) = self.take_pending(pad) else {
            return;
        };
        drop(pending);
        tracing::debug!(chain = self.id, pad = %pad.name(), %caps, "caps fixed, resuming analysis");
        Self::run_analysis(PadAnalysis {
            chain: Arc::clone(self),
            stage,
            pad: pad.clone(),
            caps: Some(caps.clone()),
        });
    }

    fn on_pending_eos(self: &Arc<Self>, stage: Option<Stage>, pad: &Pad) {
        let Some(pending) = self.take_pending(pad) else {
            return;
        };
        drop(pending);
        match pad.current_caps() {
            Some(caps) if caps.is_fixed() => {
                Self::run_analysis(PadAnalysis {
                    chain: Arc::clone(self),
                    stage,
                    pad: pad.clone(),
                    caps: Some(caps),
                });
            },
            caps => {
                if let Some(bin) = self.bin() {
                    let caps = caps.unwrap_or_else(|| pad.query_caps(None));
                    self.mark_dead(&bin, &caps, "stream ended before caps were fixed".to_string());
                }
            },
        }
    }

    fn mark_dead(&self, bin: &Arc<BinInner>, caps: &Caps, detail: String) {
        let port = {
            let mut state = self.state.lock();
            if state.dead || state.freed {
                return;
            }
            state.dead = true;
            state.dead_caps = Some(caps.clone());
            state.dead_detail = Some(detail.clone());
            state.current_port.clone()
        };
        if let Some(port) = port {
            port.retarget(None);
        }

        let err = DecodeKitError::UnsupportedType(format!("{caps}: {detail}"));
        tracing::warn!(chain = self.id, error = %err, "chain is dead");
        bin.metrics.chain_dead(caps.media_type().unwrap_or("unknown"));
        if bin.config.post_missing_plugins {
            bin.post(&BinEvent::MissingPlugin { caps: caps.clone(), detail });
        }
        bin.try_expose();
    }

    fn on_pad_removed(&self, stage: &Stage, pad: &Pad) {
        let (pending, child) = {
            let mut state = self.state.lock();
            let pending = state
                .pending
                .iter()
                .position(|p| p.pad.upgrade().as_ref() == Some(pad))
                .map(|i| state.pending.swap_remove(i));
            let child = if state.is_demuxer {
                state
                    .children
                    .iter()
                    .position(|c| c.start_pad().as_ref() == Some(pad))
                    .map(|i| state.children.remove(i))
            } else {
                None
            };
            (pending, child)
        };
        drop(pending);
        if let Some(child) = child {
            tracing::debug!(
                chain = self.id,
                stage = %stage.name(),
                pad = %pad.name(),
                child = child.id,
                "pad removed, freeing child chain"
            );
            child.free();
            if let Some(bin) = self.bin() {
                bin.try_expose();
            }
        }
    }

    fn on_no_more_pads(&self, stage: &Stage) {
        {
            let mut state = self.state.lock();
            let is_front = state.stages.front().is_some_and(|e| e.stage == *stage);
            if !is_front || !state.is_demuxer {
                return;
            }
            state.no_more_pads = true;
        }
        tracing::debug!(chain = self.id, stage = %stage.name(), "no more pads");
        if let Some(bin) = self.bin() {
            bin.try_expose();
        }
    }

    /// Complete chains are ready for exposure (or will never be).
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        if state.dead {
            return true;
        }
        if state.terminus.as_ref().is_some_and(|t| t.is_blocked() || t.is_exposed()) {
            return true;
        }
        if state.queued > 0 {
            return false;
        }
        if state.is_demuxer {
            if !state.no_more_pads {
                return false;
            }
            let children = state.children.clone();
            drop(state);
            return children.iter().all(|c| c.is_complete());
        }
        state.has_parser
    }

    /// Collects exposable termini depth-first. Returns `false` if some
    /// branch is not ready yet.
    pub fn collect_endpoints(
        &self,
        endpoints: &mut Vec<Arc<TerminusPort>>,
        missing: &mut Vec<String>,
    ) -> bool {
        let state = self.state.lock();
        if state.dead {
            let caps =
                state.dead_caps.as_ref().map_or_else(|| "unknown".to_string(), ToString::to_string);
            let detail = state.dead_detail.as_deref().unwrap_or("no detail");
            missing.push(format!("{caps} ({detail})"));
            return true;
        }
        if let Some(terminus) = &state.terminus {
            if terminus.is_blocked() || terminus.is_exposed() || state.has_parser {
                endpoints.push(Arc::clone(terminus));
                return true;
            }
            return false;
        }
        if state.queued > 0 {
            return false;
        }
        if state.is_demuxer {
            if !state.no_more_pads {
                return false;
            }
            let children = state.children.clone();
            drop(state);
            return children.iter().all(|c| c.collect_endpoints(endpoints, missing));
        }
        state.has_parser
    }

    /// Tears the chain down depth-first: children, watches, terminus, then
    /// stages.
    pub fn free(&self) {
        let (children, entries, pending, port) = {
            let mut state = self.state.lock();
            state.freed = true;
            let port = state.terminus.take().or_else(|| state.current_port.take());
            state.current_port = None;
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.stages),
                std::mem::take(&mut state.pending),
                port,
            )
        };

        for child in children {
            child.free();
        }
        drop(pending);

        let bin = self.bin();
        if let Some(port) = port {
            port.set_blocked(false);
            port.retarget(None);
            if port.is_exposed() {
                port.set_exposed(false);
                if let Some(bin) = &bin {
                    bin.unexpose(&port);
                }
            }
        }
        for entry in entries {
            drop(entry.signals);
            if let Some(bin) = &bin {
                if let Some(filter) = entry.capsfilter {
                    bin.discard_stage(&filter);
                }
                bin.discard_stage(&entry.stage);
            }
        }
        tracing::debug!(chain = self.id, "chain freed");
    }
}

/// Parser-converters and capsfilters may hand over caps that are not fixed
/// yet; plugging continues with what they report.
fn tolerates_unfixed_caps(stage: &Stage) -> bool {
    stage.klass().is_parser_converter() || stage.imp::<CapsFilter>().is_some()
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field(
                "stages",
                &state.stages.iter().map(|e| e.stage.name().to_string()).collect::<Vec<_>>(),
            )
            .field("children", &state.children.len())
            .field("dead", &state.dead)
            .finish_non_exhaustive()
    }
}
