// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pads: the linkable endpoints of stages.
//!
//! A source pad pushes [`Buffer`]s and [`Event`]s to its linked sink pad
//! (its *peer*). Pads carry:
//!
//! - **Sticky events**: stream-start, caps, segment, tags and EOS are cached
//!   per kind. Each cached event remembers whether the current peer has seen
//!   it; pending ones are forwarded before the next serialized item.
//! - **Probes**: callbacks observing buffers, events or queries. A probe with
//!   [`ProbeMask::BLOCK`] that returns [`ProbeReturn::Ok`] parks the pushing
//!   thread until the probe is removed or the pad is deactivated.
//! - **Stream lock**: a reentrant lock held while a streaming thread pushes
//!   through the pad, so control code can serialize against data flow.
//!
//! Pad locks are leaves: no pad method calls out (handlers, probes, peers,
//! signals) while holding its own state lock.

use crate::caps::Caps;
use crate::event::{Buffer, Event, EventKind, FlowReturn, Query};
use crate::signal::{Signal, SignalHandle};
use crate::stage::{Stage, WeakStage};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    Src,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadPresence {
    /// Exists as soon as the stage exists.
    Always,
    /// Created by the stage at runtime (e.g. one per demuxed stream).
    Sometimes,
    /// Created on request.
    Request,
}

/// Static description of a pad a factory's stages can have.
#[derive(Debug, Clone)]
pub struct PadTemplate {
    pub name_template: String,
    pub direction: PadDirection,
    pub presence: PadPresence,
    pub caps: Caps,
}

impl PadTemplate {
    pub fn new(
        name_template: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
        caps: Caps,
    ) -> Self {
        Self { name_template: name_template.into(), direction, presence, caps }
    }

    /// An always-present sink template.
    pub fn sink(caps: Caps) -> Self {
        Self::new("sink", PadDirection::Sink, PadPresence::Always, caps)
    }

    /// A source template.
    pub fn src(name_template: impl Into<String>, presence: PadPresence, caps: Caps) -> Self {
        Self::new(name_template, PadDirection::Src, presence, caps)
    }
}

/// Reasons [`Pad::link`] can fail.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PadLinkError {
    #[error("pads have wrong direction")]
    WrongDirection,
    #[error("pad is already linked")]
    AlreadyLinked,
    #[error("pads have no common format")]
    NoFormat,
}

/// Behaviour attached to a pad by its owner.
///
/// Only `event` and `chain` are required; the rest fall back to the pad's
/// template.
pub trait PadHandler: Send + Sync {
    /// Handles an event arriving on a sink pad.
    fn event(&self, pad: &Pad, event: Event) -> bool;

    /// Handles a buffer arriving on a sink pad.
    fn chain(&self, pad: &Pad, buffer: Buffer) -> FlowReturn;

    fn query(&self, _pad: &Pad, _query: &Query) -> bool {
        false
    }

    /// Caps this pad can handle, optionally restricted by `filter`.
    fn query_caps(&self, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let caps = pad.template_caps();
        filter.map_or_else(|| caps.clone(), |f| f.intersect(&caps))
    }

    fn accept_caps(&self, pad: &Pad, caps: &Caps) -> bool {
        default_accept_caps(caps, &pad.query_caps(None))
    }
}

/// Fixed caps must be a subset of what the pad can do; unfixed caps only
/// need to overlap.
pub fn default_accept_caps(caps: &Caps, allowed: &Caps) -> bool {
    if caps.is_fixed() {
        caps.is_subset(allowed)
    } else {
        caps.can_intersect(allowed)
    }
}

/// Bit set selecting which traffic a probe observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeMask(u32);

impl ProbeMask {
    pub const BUFFER: Self = Self(1);
    pub const EVENT_DOWNSTREAM: Self = Self(1 << 1);
    pub const QUERY_DOWNSTREAM: Self = Self(1 << 2);
    pub const BLOCK: Self = Self(1 << 3);
    pub const DATA_DOWNSTREAM: Self = Self(Self::BUFFER.0 | Self::EVENT_DOWNSTREAM.0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ProbeMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a probe observed.
#[derive(Debug, Clone, Copy)]
pub enum ProbeData<'a> {
    Buffer(&'a Buffer),
    Event(&'a Event),
    Query(&'a Query),
}

impl ProbeData<'_> {
    const fn mask(&self) -> ProbeMask {
        match self {
            Self::Buffer(_) => ProbeMask::BUFFER,
            Self::Event(_) => ProbeMask::EVENT_DOWNSTREAM,
            Self::Query(_) => ProbeMask::QUERY_DOWNSTREAM,
        }
    }

    /// Whether the item travels in order with buffers.
    pub const fn is_serialized(&self) -> bool {
        match self {
            Self::Buffer(_) => true,
            Self::Event(e) => e.is_serialized(),
            Self::Query(q) => q.is_serialized(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(u64);

#[derive(Debug, Clone, Copy)]
pub struct ProbeInfo<'a> {
    pub id: ProbeId,
    pub data: ProbeData<'a>,
}

/// Probe verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Let the item through; blocking probes block.
    Ok,
    /// Discard the item.
    Drop,
    /// Remove this probe and let the item through.
    Remove,
    /// Let the item through without blocking.
    Pass,
    /// The probe consumed the item; report success.
    Handled,
}

type ProbeCallback = Arc<dyn Fn(&Pad, &ProbeInfo<'_>) -> ProbeReturn + Send + Sync>;

struct ProbeEntry {
    id: ProbeId,
    mask: ProbeMask,
    callback: ProbeCallback,
}

enum ProbeOutcome {
    Continue,
    Drop,
    Handled,
    Flushing,
}

struct StickySlot {
    event: Event,
    seq: u64,
    received: bool,
}

#[derive(Default)]
struct PadState {
    peer: Option<WeakPad>,
    active: bool,
    sticky: Vec<StickySlot>,
    next_seq: u64,
    probes: Vec<ProbeEntry>,
    next_probe_id: u64,
    caps: Option<Caps>,
}

impl PadState {
    fn store_sticky(&mut self, event: Event, received: bool) {
        let kind = event.kind();
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Event::Caps(caps) = &event {
            self.caps = Some(caps.clone());
        }
        if let Event::StreamStart { stream_id, .. } = &event {
            let changed = self.sticky.iter().any(|s| {
                matches!(&s.event, Event::StreamStart { stream_id: old, .. } if old != stream_id)
            });
            if changed {
                // A new stream invalidates everything that described the old one.
                self.sticky.retain(|s| s.event.kind() == EventKind::StreamStart);
                self.caps = None;
            }
        }
        match self.sticky.iter_mut().find(|s| s.event.kind() == kind) {
            Some(slot) => *slot = StickySlot { event, seq, received },
            None => {
                self.sticky.push(StickySlot { event, seq, received });
                self.sticky.sort_by_key(|s| s.event.kind());
            },
        }
    }
}

struct PadInner {
    name: Mutex<String>,
    direction: PadDirection,
    template: Option<PadTemplate>,
    parent: Mutex<Option<WeakStage>>,
    state: Mutex<PadState>,
    unblocked: Condvar,
    stream_lock: ReentrantMutex<()>,
    handler: Mutex<Option<Arc<dyn PadHandler>>>,
    caps_notify: Signal<Caps>,
}

/// Reference-counted pad handle. Clones refer to the same pad.
#[derive(Clone)]
pub struct Pad(Arc<PadInner>);

/// Non-owning pad reference.
#[derive(Clone)]
pub struct WeakPad(Weak<PadInner>);

impl WeakPad {
    pub fn upgrade(&self) -> Option<Pad> {
        self.0.upgrade().map(Pad)
    }
}

impl fmt::Debug for WeakPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(pad) => write!(f, "WeakPad({})", pad.name()),
            None => f.write_str("WeakPad(<dropped>)"),
        }
    }
}

/// RAII probe registration; removes the probe when dropped.
pub struct ProbeHandle {
    pad: WeakPad,
    id: ProbeId,
}

impl ProbeHandle {
    pub const fn id(&self) -> ProbeId {
        self.id
    }

    pub fn pad(&self) -> Option<Pad> {
        self.pad.upgrade()
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        if let Some(pad) = self.pad.upgrade() {
            pad.remove_probe(self.id);
        }
    }
}

impl fmt::Debug for ProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeHandle").field("pad", &self.pad).field("id", &self.id).finish()
    }
}

impl Pad {
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Self {
        Self::build(name.into(), direction, None)
    }

    pub fn from_template(template: &PadTemplate, name: impl Into<String>) -> Self {
        Self::build(name.into(), template.direction, Some(template.clone()))
    }

    fn build(name: String, direction: PadDirection, template: Option<PadTemplate>) -> Self {
        Self(Arc::new(PadInner {
            name: Mutex::new(name),
            direction,
            template,
            parent: Mutex::new(None),
            state: Mutex::new(PadState::default()),
            unblocked: Condvar::new(),
            stream_lock: ReentrantMutex::new(()),
            handler: Mutex::new(None),
            caps_notify: Signal::new(),
        }))
    }

    pub fn name(&self) -> String {
        self.0.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock() = name.into();
    }

    pub fn direction(&self) -> PadDirection {
        self.0.direction
    }

    pub fn template(&self) -> Option<&PadTemplate> {
        self.0.template.as_ref()
    }

    /// Template caps, or ANY for template-less pads.
    pub fn template_caps(&self) -> Caps {
        self.0.template.as_ref().map_or_else(Caps::new_any, |t| t.caps.clone())
    }

    pub fn set_handler(&self, handler: Arc<dyn PadHandler>) {
        *self.0.handler.lock() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn PadHandler>> {
        self.0.handler.lock().clone()
    }

    pub fn downgrade(&self) -> WeakPad {
        WeakPad(Arc::downgrade(&self.0))
    }

    pub(crate) fn set_parent(&self, parent: Option<WeakStage>) {
        *self.0.parent.lock() = parent;
    }

    pub fn parent_stage(&self) -> Option<Stage> {
        self.0.parent.lock().as_ref().and_then(WeakStage::upgrade)
    }

    pub fn peer(&self) -> Option<Self> {
        self.0.state.lock().peer.as_ref().and_then(WeakPad::upgrade)
    }

    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.0.state.lock().active
    }

    /// Activates or deactivates the pad. Deactivation wakes any thread
    /// parked in a blocking probe; pushes then fail with `Flushing`.
    pub fn set_active(&self, active: bool) {
        let mut state = self.0.state.lock();
        state.active = active;
        drop(state);
        if !active {
            self.0.unblocked.notify_all();
        }
    }

    /// Current negotiated caps (from the last caps event).
    pub fn current_caps(&self) -> Option<Caps> {
        self.0.state.lock().caps.clone()
    }

    /// Takes this pad's stream lock; re-entrant on the same thread.
    pub fn stream_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.stream_lock.lock()
    }

    /// Links `src` to `sink` after checking direction and caps overlap.
    ///
    /// Sticky events already cached on `src` are marked undelivered so the
    /// new peer receives them with the next serialized item or an explicit
    /// [`Pad::push_sticky_events`].
    pub fn link(src: &Self, sink: &Self) -> Result<(), PadLinkError> {
        if src.direction() != PadDirection::Src || sink.direction() != PadDirection::Sink {
            return Err(PadLinkError::WrongDirection);
        }
        if src.is_linked() || sink.is_linked() {
            return Err(PadLinkError::AlreadyLinked);
        }

        let src_caps = src.query_caps(None);
        let sink_caps = sink.query_caps(None);
        if !src_caps.can_intersect(&sink_caps) {
            return Err(PadLinkError::NoFormat);
        }

        {
            let mut state = src.0.state.lock();
            if state.peer.is_some() {
                return Err(PadLinkError::AlreadyLinked);
            }
            state.peer = Some(sink.downgrade());
            for slot in &mut state.sticky {
                slot.received = false;
            }
        }
        {
            let mut state = sink.0.state.lock();
            if state.peer.is_none() {
                state.peer = Some(src.downgrade());
                return Ok(());
            }
        }
        src.0.state.lock().peer = None;
        Err(PadLinkError::AlreadyLinked)
    }

    /// Unlinks this pad from its peer. Returns `false` if it was not linked.
    pub fn unlink(&self) -> bool {
        let Some(peer) = self.0.state.lock().peer.take().and_then(|p| p.upgrade()) else {
            return false;
        };
        let mut peer_state = peer.0.state.lock();
        if peer_state.peer.as_ref().and_then(WeakPad::upgrade).is_some_and(|p| p == *self) {
            peer_state.peer = None;
        }
        true
    }

    /// Pushes an event out of a source pad.
    ///
    /// Sticky events are cached first (even on an inactive pad), then every
    /// undelivered sticky event is forwarded in order. Returns `true` for a
    /// cached sticky event on an active pad even when no peer is linked yet.
    pub fn push_event(&self, event: Event) -> bool {
        let serialized = event.is_serialized();
        let _stream = serialized.then(|| self.stream_lock());

        if event.is_sticky() {
            let caps = event.caps().cloned();
            let active = {
                let mut state = self.0.state.lock();
                state.store_sticky(event, false);
                state.active
            };
            if let Some(caps) = caps {
                self.0.caps_notify.emit(&caps);
            }
            if !active {
                return false;
            }
            self.push_sticky_events();
            return true;
        }

        if !self.is_active() {
            return false;
        }
        if serialized && !self.push_sticky_events() {
            return false;
        }
        self.forward_event(event)
    }

    /// Forwards every cached sticky event the peer has not seen yet.
    /// Stops at the first delivery failure. Without a peer every event still
    /// goes through the probes and stays pending.
    pub fn push_sticky_events(&self) -> bool {
        let pending: Vec<(u64, Event)> = self
            .0
            .state
            .lock()
            .sticky
            .iter()
            .filter(|s| !s.received)
            .map(|s| (s.seq, s.event.clone()))
            .collect();

        let linked = self.is_linked();
        let mut delivered = true;
        for (seq, event) in pending {
            if !self.forward_event(event) {
                if linked {
                    return false;
                }
                delivered = false;
                continue;
            }
            let mut state = self.0.state.lock();
            if let Some(slot) = state.sticky.iter_mut().find(|s| s.seq == seq) {
                slot.received = true;
            }
        }
        delivered
    }

    fn forward_event(&self, event: Event) -> bool {
        match self.run_probes(ProbeData::Event(&event)) {
            ProbeOutcome::Continue => {},
            ProbeOutcome::Drop | ProbeOutcome::Handled => return true,
            ProbeOutcome::Flushing => return false,
        }
        self.peer().is_some_and(|peer| peer.send_event(event))
    }

    /// Pushes a buffer out of a source pad to its peer.
    pub fn push(&self, buffer: Buffer) -> FlowReturn {
        let _stream = self.stream_lock();
        if !self.is_active() {
            return FlowReturn::Flushing;
        }
        if !self.push_sticky_events() {
            return if self.is_active() { FlowReturn::NotLinked } else { FlowReturn::Flushing };
        }
        match self.run_probes(ProbeData::Buffer(&buffer)) {
            ProbeOutcome::Continue => {},
            ProbeOutcome::Drop | ProbeOutcome::Handled => return FlowReturn::Ok,
            ProbeOutcome::Flushing => return FlowReturn::Flushing,
        }
        match self.peer() {
            Some(peer) => peer.chain(buffer),
            None => FlowReturn::NotLinked,
        }
    }

    /// Delivers an event into a sink pad and its handler.
    pub fn send_event(&self, event: Event) -> bool {
        let _stream = event.is_serialized().then(|| self.stream_lock());
        let caps = event.caps().cloned();
        {
            let mut state = self.0.state.lock();
            if !state.active {
                return false;
            }
            if event.is_sticky() {
                state.store_sticky(event.clone(), true);
            }
        }
        if let Some(caps) = caps {
            self.0.caps_notify.emit(&caps);
        }
        self.handler().is_some_and(|h| h.event(self, event))
    }

    /// Delivers a buffer into a sink pad and its handler.
    pub fn chain(&self, buffer: Buffer) -> FlowReturn {
        let _stream = self.stream_lock();
        if !self.is_active() {
            return FlowReturn::Flushing;
        }
        match self.handler() {
            Some(handler) => handler.chain(self, buffer),
            None => FlowReturn::NotLinked,
        }
    }

    /// Sends a query to the peer of a source pad.
    pub fn peer_query(&self, query: &Query) -> bool {
        let _stream = query.is_serialized().then(|| self.stream_lock());
        match self.run_probes(ProbeData::Query(query)) {
            ProbeOutcome::Continue => {},
            ProbeOutcome::Handled => return true,
            ProbeOutcome::Drop | ProbeOutcome::Flushing => return false,
        }
        self.peer().is_some_and(|peer| peer.query(query))
    }

    pub fn query(&self, query: &Query) -> bool {
        self.handler().is_some_and(|h| h.query(self, query))
    }

    /// Caps this pad can produce or accept.
    ///
    /// A source pad with negotiated caps answers with those.
    pub fn query_caps(&self, filter: Option<&Caps>) -> Caps {
        if self.direction() == PadDirection::Src {
            if let Some(caps) = self.current_caps() {
                return filter.map_or_else(|| caps.clone(), |f| f.intersect(&caps));
            }
        }
        match self.handler() {
            Some(handler) => handler.query_caps(self, filter),
            None => {
                let caps = self.template_caps();
                filter.map_or_else(|| caps.clone(), |f| f.intersect(&caps))
            },
        }
    }

    pub fn peer_query_caps(&self, filter: Option<&Caps>) -> Caps {
        self.peer().map_or_else(
            || filter.map_or_else(Caps::new_any, Clone::clone),
            |peer| peer.query_caps(filter),
        )
    }

    pub fn query_accept_caps(&self, caps: &Caps) -> bool {
        match self.handler() {
            Some(handler) => handler.accept_caps(self, caps),
            None => default_accept_caps(caps, &self.template_caps()),
        }
    }

    /// Snapshot of the cached sticky events in delivery order.
    pub fn sticky_events(&self) -> Vec<Event> {
        self.0.state.lock().sticky.iter().map(|s| s.event.clone()).collect()
    }

    pub fn sticky_event(&self, kind: EventKind) -> Option<Event> {
        self.0.state.lock().sticky.iter().find(|s| s.event.kind() == kind).map(|s| s.event.clone())
    }

    /// Marks every cached sticky event as delivered to the current peer.
    pub fn mark_sticky_received(&self) {
        for slot in &mut self.0.state.lock().sticky {
            slot.received = true;
        }
    }

    /// Drops the sticky cache and negotiated caps.
    pub fn clear_sticky_events(&self) {
        let mut state = self.0.state.lock();
        state.sticky.clear();
        state.caps = None;
    }

    /// Installs a probe. The returned handle removes it on drop.
    #[must_use = "dropping the handle removes the probe"]
    pub fn add_probe<F>(&self, mask: ProbeMask, callback: F) -> ProbeHandle
    where
        F: Fn(&Self, &ProbeInfo<'_>) -> ProbeReturn + Send + Sync + 'static,
    {
        let mut state = self.0.state.lock();
        let id = ProbeId(state.next_probe_id);
        state.next_probe_id += 1;
        state.probes.push(ProbeEntry { id, mask, callback: Arc::new(callback) });
        ProbeHandle { pad: self.downgrade(), id }
    }

    /// Removes a probe and releases any thread it is blocking.
    pub fn remove_probe(&self, id: ProbeId) {
        self.0.state.lock().probes.retain(|p| p.id != id);
        self.0.unblocked.notify_all();
    }

    pub fn has_probe(&self, id: ProbeId) -> bool {
        self.0.state.lock().probes.iter().any(|p| p.id == id)
    }

    /// Notifies on every new caps event stored on this pad.
    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_caps_notify<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(&Caps) + Send + Sync + 'static,
    {
        self.0.caps_notify.connect(f)
    }

    fn run_probes(&self, data: ProbeData<'_>) -> ProbeOutcome {
        let kind = data.mask();
        let matching: Vec<(ProbeId, ProbeMask, ProbeCallback)> = self
            .0
            .state
            .lock()
            .probes
            .iter()
            .filter(|p| p.mask.contains(kind))
            .map(|p| (p.id, p.mask, Arc::clone(&p.callback)))
            .collect();

        for (id, mask, callback) in matching {
            if !self.has_probe(id) {
                continue;
            }
            match callback(self, &ProbeInfo { id, data }) {
                ProbeReturn::Ok => {
                    if mask.contains(ProbeMask::BLOCK) && !self.wait_unblocked(id) {
                        return ProbeOutcome::Flushing;
                    }
                },
                ProbeReturn::Pass => {},
                ProbeReturn::Remove => self.remove_probe(id),
                ProbeReturn::Drop => return ProbeOutcome::Drop,
                ProbeReturn::Handled => return ProbeOutcome::Handled,
            }
        }
        ProbeOutcome::Continue
    }

    /// Parks until probe `id` is gone. Returns `false` if the pad was
    /// deactivated instead.
    fn wait_unblocked(&self, id: ProbeId) -> bool {
        let mut state = self.0.state.lock();
        loop {
            if !state.active {
                return false;
            }
            if !state.probes.iter().any(|p| p.id == id) {
                return true;
            }
            self.0.unblocked.wait(&mut state);
        }
    }
}

impl PartialEq for Pad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Pad {}

impl Hash for Pad {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pad")
            .field("name", &self.name())
            .field("direction", &self.0.direction)
            .finish()
    }
}
