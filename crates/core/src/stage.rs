// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Processing stages and their lifecycle.
//!
//! A [`Stage`] is one processing unit (demuxer, parser, decoder, filter).
//! Behaviour lives in a [`StageImpl`]; the `Stage` handle owns the pads, the
//! state machine and the pad-added / pad-removed / no-more-pads signals.
//!
//! ## State machine
//!
//! `Null → Ready → Paused → Playing`, walked one transition at a time.
//! Pads are activated when entering `Paused` and deactivated when leaving it
//! downwards, before the implementation sees the transition.

use crate::caps::Caps;
use crate::error::{DecodeKitError, Result};
use crate::event::{Buffer, Event, FlowReturn, Query};
use crate::pad::{default_accept_caps, Pad, PadDirection, PadHandler, PadPresence};
use crate::registry::{Klass, StageFactory};
use crate::signal::{Signal, SignalHandle};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// A single step of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    /// The next step from `current` towards `target`, if any.
    pub const fn towards(current: StageState, target: StageState) -> Option<Self> {
        use StageState::{Null, Paused, Playing, Ready};
        match (current, target) {
            (Null, Ready | Paused | Playing) => Some(Self::NullToReady),
            (Ready, Paused | Playing) => Some(Self::ReadyToPaused),
            (Paused, Playing) => Some(Self::PausedToPlaying),
            (Playing, Paused | Ready | Null) => Some(Self::PlayingToPaused),
            (Paused, Ready | Null) => Some(Self::PausedToReady),
            (Ready, Null) => Some(Self::ReadyToNull),
            _ => None,
        }
    }

    pub const fn next(self) -> StageState {
        match self {
            Self::NullToReady | Self::PausedToReady => StageState::Ready,
            Self::ReadyToPaused | Self::PlayingToPaused => StageState::Paused,
            Self::PausedToPlaying => StageState::Playing,
            Self::ReadyToNull => StageState::Null,
        }
    }

    pub const fn is_upward(self) -> bool {
        matches!(self, Self::NullToReady | Self::ReadyToPaused | Self::PausedToPlaying)
    }
}

/// Behaviour of a stage family. Every method has a pass-through default.
pub trait StageImpl: Any + Send + Sync {
    /// Runs once after the stage's always-pads exist.
    fn construct(&self, _stage: &Stage) -> Result<()> {
        Ok(())
    }

    fn change_state(&self, _stage: &Stage, _transition: StateChange) -> Result<()> {
        Ok(())
    }

    /// An event arrived on one of the stage's sink pads.
    fn sink_event(&self, stage: &Stage, _pad: &Pad, event: Event) -> bool {
        stage.src_pads().iter().fold(true, |ok, src| src.push_event(event.clone()) && ok)
    }

    /// A buffer arrived on one of the stage's sink pads.
    fn chain(&self, stage: &Stage, _pad: &Pad, buffer: Buffer) -> FlowReturn {
        let mut ret = FlowReturn::Ok;
        for src in stage.src_pads() {
            let r = src.push(buffer.clone());
            if !r.is_ok() {
                ret = r;
            }
        }
        ret
    }

    fn query(&self, _stage: &Stage, _pad: &Pad, _query: &Query) -> bool {
        false
    }

    fn query_caps(&self, _stage: &Stage, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let caps = pad.template_caps();
        filter.map_or_else(|| caps.clone(), |f| f.intersect(&caps))
    }

    fn accept_caps(&self, _stage: &Stage, pad: &Pad, caps: &Caps) -> bool {
        default_accept_caps(caps, &pad.template_caps())
    }
}

/// Routes pad callbacks to the owning stage's implementation.
struct StagePadHandler {
    stage: WeakStage,
}

impl PadHandler for StagePadHandler {
    fn event(&self, pad: &Pad, event: Event) -> bool {
        self.stage.upgrade().is_some_and(|s| s.0.imp.sink_event(&s, pad, event))
    }

    fn chain(&self, pad: &Pad, buffer: Buffer) -> FlowReturn {
        self.stage.upgrade().map_or(FlowReturn::Flushing, |s| s.0.imp.chain(&s, pad, buffer))
    }

    fn query(&self, pad: &Pad, query: &Query) -> bool {
        self.stage.upgrade().is_some_and(|s| s.0.imp.query(&s, pad, query))
    }

    fn query_caps(&self, pad: &Pad, filter: Option<&Caps>) -> Caps {
        match self.stage.upgrade() {
            Some(s) => s.0.imp.query_caps(&s, pad, filter),
            None => Caps::new_empty(),
        }
    }

    fn accept_caps(&self, pad: &Pad, caps: &Caps) -> bool {
        self.stage.upgrade().is_some_and(|s| s.0.imp.accept_caps(&s, pad, caps))
    }
}

struct StageInner {
    name: String,
    factory: Arc<StageFactory>,
    imp: Box<dyn StageImpl>,
    pads: Mutex<Vec<Pad>>,
    state: Mutex<StageState>,
    locked_state: AtomicBool,
    pad_added: Signal<Pad>,
    pad_removed: Signal<Pad>,
    no_more_pads: Signal<()>,
}

/// Reference-counted stage handle.
#[derive(Clone)]
pub struct Stage(Arc<StageInner>);

/// Non-owning stage reference.
#[derive(Clone)]
pub struct WeakStage(Weak<StageInner>);

impl WeakStage {
    pub fn upgrade(&self) -> Option<Stage> {
        self.0.upgrade().map(Stage)
    }
}

impl Stage {
    /// Builds a stage, creates a pad for every always-template, then runs
    /// [`StageImpl::construct`].
    pub(crate) fn new(
        name: String,
        factory: Arc<StageFactory>,
        imp: Box<dyn StageImpl>,
    ) -> Result<Self> {
        let stage = Self(Arc::new(StageInner {
            name,
            factory,
            imp,
            pads: Mutex::new(Vec::new()),
            state: Mutex::new(StageState::Null),
            locked_state: AtomicBool::new(false),
            pad_added: Signal::new(),
            pad_removed: Signal::new(),
            no_more_pads: Signal::new(),
        }));

        let always: Vec<_> = stage
            .0
            .factory
            .templates()
            .iter()
            .filter(|t| t.presence == PadPresence::Always)
            .cloned()
            .collect();
        for template in &always {
            stage.add_pad(Pad::from_template(template, template.name_template.clone()))?;
        }

        stage.0.imp.construct(&stage)?;
        Ok(stage)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn factory(&self) -> &Arc<StageFactory> {
        &self.0.factory
    }

    pub fn factory_name(&self) -> &str {
        self.0.factory.name()
    }

    pub fn klass(&self) -> &Klass {
        self.0.factory.klass()
    }

    /// Downcasts the implementation.
    pub fn imp<T: StageImpl>(&self) -> Option<&T> {
        let any: &dyn Any = self.0.imp.as_ref();
        any.downcast_ref::<T>()
    }

    pub fn downgrade(&self) -> WeakStage {
        WeakStage(Arc::downgrade(&self.0))
    }

    pub fn current_state(&self) -> StageState {
        *self.0.state.lock()
    }

    /// A locked stage keeps its state when its container changes state.
    pub fn set_locked_state(&self, locked: bool) {
        self.0.locked_state.store(locked, Ordering::SeqCst);
    }

    pub fn is_locked_state(&self) -> bool {
        self.0.locked_state.load(Ordering::SeqCst)
    }

    pub fn pads(&self) -> Vec<Pad> {
        self.0.pads.lock().clone()
    }

    pub fn src_pads(&self) -> Vec<Pad> {
        self.0.pads.lock().iter().filter(|p| p.direction() == PadDirection::Src).cloned().collect()
    }

    pub fn sink_pads(&self) -> Vec<Pad> {
        self.0.pads.lock().iter().filter(|p| p.direction() == PadDirection::Sink).cloned().collect()
    }

    /// The first sink pad.
    pub fn sink_pad(&self) -> Option<Pad> {
        self.0.pads.lock().iter().find(|p| p.direction() == PadDirection::Sink).cloned()
    }

    pub fn static_pad(&self, name: &str) -> Option<Pad> {
        self.0.pads.lock().iter().find(|p| p.name() == name).cloned()
    }

    /// Adds a pad and emits `pad-added`.
    pub fn add_pad(&self, pad: Pad) -> Result<()> {
        let name = pad.name();
        {
            let mut pads = self.0.pads.lock();
            if pads.iter().any(|p| p.name() == name) {
                return Err(DecodeKitError::StructuralViolation(format!(
                    "stage {} already has a pad named {name}",
                    self.name()
                )));
            }
            pads.push(pad.clone());
        }
        pad.set_parent(Some(self.downgrade()));
        pad.set_handler(Arc::new(StagePadHandler { stage: self.downgrade() }));
        if self.current_state() >= StageState::Paused {
            pad.set_active(true);
        }
        tracing::trace!(stage = %self.name(), pad = %name, "pad added");
        self.0.pad_added.emit(&pad);
        Ok(())
    }

    /// Deactivates, unlinks and removes a pad, then emits `pad-removed`.
    pub fn remove_pad(&self, pad: &Pad) -> Result<()> {
        {
            let mut pads = self.0.pads.lock();
            let before = pads.len();
            pads.retain(|p| p != pad);
            if pads.len() == before {
                return Err(DecodeKitError::NotFound(format!(
                    "pad {} on {}",
                    pad.name(),
                    self.name()
                )));
            }
        }
        pad.set_active(false);
        pad.unlink();
        tracing::trace!(stage = %self.name(), pad = %pad.name(), "pad removed");
        self.0.pad_removed.emit(pad);
        pad.set_parent(None);
        Ok(())
    }

    /// Announces that no further pads will be added.
    pub fn emit_no_more_pads(&self) {
        self.0.no_more_pads.emit(&());
    }

    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_pad_added<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(&Self, &Pad) + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        self.0.pad_added.connect(move |pad| {
            if let Some(stage) = weak.upgrade() {
                f(&stage, pad);
            }
        })
    }

    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_pad_removed<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(&Self, &Pad) + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        self.0.pad_removed.connect(move |pad| {
            if let Some(stage) = weak.upgrade() {
                f(&stage, pad);
            }
        })
    }

    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_no_more_pads<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        self.0.no_more_pads.connect(move |()| {
            if let Some(stage) = weak.upgrade() {
                f(&stage);
            }
        })
    }

    /// Walks the state machine to `target` one step at a time.
    pub fn set_state(&self, target: StageState) -> Result<()> {
        loop {
            let current = self.current_state();
            let Some(transition) = StateChange::towards(current, target) else {
                return Ok(());
            };
            let next = transition.next();

            if transition.is_upward() {
                *self.0.state.lock() = next;
                if transition == StateChange::ReadyToPaused {
                    for pad in self.pads() {
                        pad.set_active(true);
                    }
                }
                if let Err(e) = self.0.imp.change_state(self, transition) {
                    if transition == StateChange::ReadyToPaused {
                        for pad in self.pads() {
                            pad.set_active(false);
                        }
                    }
                    *self.0.state.lock() = current;
                    return Err(DecodeKitError::StateChange(format!(
                        "{} failed {transition:?}: {e}",
                        self.name()
                    )));
                }
            } else {
                if transition == StateChange::PausedToReady {
                    // The next stream starts from a clean sticky cache.
                    for pad in self.pads() {
                        pad.set_active(false);
                        pad.clear_sticky_events();
                    }
                }
                let result = self.0.imp.change_state(self, transition);
                *self.0.state.lock() = next;
                if let Err(e) = result {
                    tracing::warn!(
                        stage = %self.name(),
                        ?transition,
                        error = %e,
                        "downward state change failed"
                    );
                }
            }
            tracing::trace!(stage = %self.name(), ?transition, "state changed");
        }
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Stage {}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.0.name)
            .field("factory", &self.0.factory.name())
            .field("state", &self.current_state())
            .finish()
    }
}

impl fmt::Debug for WeakStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(stage) => write!(f, "WeakStage({})", stage.name()),
            None => f.write_str("WeakStage(<dropped>)"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pad::PadTemplate;
    use crate::registry::rank;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        transitions: Arc<Mutex<Vec<StateChange>>>,
        fail_on: Option<StateChange>,
    }

    impl StageImpl for Counting {
        fn change_state(&self, _stage: &Stage, transition: StateChange) -> Result<()> {
            if self.fail_on == Some(transition) {
                return Err("refused".into());
            }
            self.transitions.lock().push(transition);
            Ok(())
        }
    }

    fn factory(
        transitions: Arc<Mutex<Vec<StateChange>>>,
        fail_on: Option<StateChange>,
    ) -> Arc<StageFactory> {
        Arc::new(StageFactory::new(
            "counting",
            "Codec/Parser/Audio",
            rank::PRIMARY,
            vec![
                PadTemplate::sink(Caps::new_simple("audio/mpeg")),
                PadTemplate::src("src", PadPresence::Always, Caps::new_simple("audio/mpeg")),
            ],
            move || {
                Ok(Box::new(Counting { transitions: transitions.clone(), fail_on })
                    as Box<dyn StageImpl>)
            },
        ))
    }

    #[test]
    fn test_always_pads_created() {
        let stage = factory(Arc::default(), None).create(None).unwrap();
        assert!(stage.sink_pad().is_some());
        assert_eq!(stage.src_pads().len(), 1);
        assert!(stage.static_pad("src").unwrap().parent_stage().is_some());
        assert!(stage.imp::<Counting>().is_some());
    }

    #[test]
    fn test_state_walk_and_pad_activation() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let stage = factory(transitions.clone(), None).create(None).unwrap();
        let src = stage.static_pad("src").unwrap();

        stage.set_state(StageState::Playing).unwrap();
        assert!(src.is_active());
        assert_eq!(
            *transitions.lock(),
            vec![StateChange::NullToReady, StateChange::ReadyToPaused, StateChange::PausedToPlaying]
        );

        src.push_event(Event::Caps(Caps::new_simple("audio/mpeg")));
        assert!(src.current_caps().is_some());

        stage.set_state(StageState::Ready).unwrap();
        assert!(!src.is_active());
        assert_eq!(stage.current_state(), StageState::Ready);
        assert!(src.current_caps().is_none());
        assert!(src.sticky_events().is_empty());
    }

    #[test]
    fn test_failed_upward_transition_reverts() {
        let stage = factory(Arc::default(), Some(StateChange::ReadyToPaused)).create(None).unwrap();
        assert!(stage.set_state(StageState::Playing).is_err());
        assert_eq!(stage.current_state(), StageState::Ready);
        assert!(!stage.static_pad("src").unwrap().is_active());
    }

    #[test]
    fn test_pad_signals() {
        let stage = factory(Arc::default(), None).create(None).unwrap();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let (a, r) = (added.clone(), removed.clone());
        let _h1 = stage.connect_pad_added(move |_, _| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let _h2 = stage.connect_pad_removed(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let pad = Pad::new("src_1", PadDirection::Src);
        stage.add_pad(pad.clone()).unwrap();
        assert!(stage.add_pad(Pad::new("src_1", PadDirection::Src)).is_err());
        stage.remove_pad(&pad).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(pad.parent_stage().is_none());
    }
}
