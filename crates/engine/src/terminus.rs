// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Terminus ports: the externally visible end of a processing chain.
//!
//! A terminus is a pair of pads:
//! - the **ghost**, a source pad published on the bin once exposed;
//! - the **proxy**, an internal sink pad linked to the *target* (the live
//!   source pad currently ending the chain).
//!
//! Everything arriving on the proxy is pushed out of the ghost. The target
//! changes as the chain grows; the ghost never does.
//!
//! Blocking installs a probe on the target that parks the streaming thread on
//! the first serialized buffer, event or query (sticky metadata passes) and
//! asks the bin to try exposing.

use crate::bin::BinInner;
use crate::chain::Chain;
use decodekit_core::pad::{ProbeData, ProbeHandle};
use decodekit_core::{
    Buffer, Caps, Event, EventKind, FlowReturn, Pad, PadDirection, PadHandler, ProbeMask,
    ProbeReturn, Query, StreamInfo, TagList,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct TerminusState {
    target: Option<Pad>,
    chain: Weak<Chain>,
    /// A serialized item reached the block probe.
    blocked: bool,
    /// The block probe is (or should be) installed.
    blocking: bool,
    exposed: bool,
    block_probe: Option<ProbeHandle>,
    active_stream: Option<Arc<StreamInfo>>,
}

pub(crate) struct TerminusPort {
    bin: Weak<BinInner>,
    ghost: Pad,
    proxy: Pad,
    state: Mutex<TerminusState>,
}

/// Internal sink half: forwards into the ghost.
struct ProxyHandler {
    port: Weak<TerminusPort>,
}

impl PadHandler for ProxyHandler {
    fn event(&self, _pad: &Pad, event: Event) -> bool {
        let Some(port) = self.port.upgrade() else {
            return false;
        };
        let event = port.handle_event(event);
        let sticky = event.is_sticky();
        // An inactive ghost still caches sticky events for later replay.
        port.ghost.push_event(event) || (sticky && !port.ghost.is_active())
    }

    fn chain(&self, _pad: &Pad, buffer: Buffer) -> FlowReturn {
        self.port.upgrade().map_or(FlowReturn::Flushing, |port| port.ghost.push(buffer))
    }

    fn query(&self, _pad: &Pad, query: &Query) -> bool {
        self.port.upgrade().is_some_and(|port| port.ghost.peer_query(query))
    }

    fn query_caps(&self, _pad: &Pad, filter: Option<&Caps>) -> Caps {
        self.port
            .upgrade()
            .map_or_else(Caps::new_any, |port| port.ghost.peer_query_caps(filter))
    }

    fn accept_caps(&self, _pad: &Pad, caps: &Caps) -> bool {
        self.port
            .upgrade()
            .and_then(|port| port.ghost.peer())
            .is_none_or(|peer| peer.query_accept_caps(caps))
    }
}

/// External source half: answers caps queries from the target.
struct GhostHandler {
    port: Weak<TerminusPort>,
}

impl PadHandler for GhostHandler {
    fn event(&self, _pad: &Pad, _event: Event) -> bool {
        false
    }

    fn chain(&self, _pad: &Pad, _buffer: Buffer) -> FlowReturn {
        FlowReturn::NotLinked
    }

    fn query_caps(&self, _pad: &Pad, filter: Option<&Caps>) -> Caps {
        let target = self.port.upgrade().and_then(|port| port.target());
        match target {
            Some(target) => target.query_caps(filter),
            None => filter.map_or_else(Caps::new_any, Clone::clone),
        }
    }
}

impl TerminusPort {
    pub fn new(bin: &Arc<BinInner>, chain: &Arc<Chain>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let ghost = Pad::new(format!("ghost-chain{}", chain.id()), PadDirection::Src);
            ghost.set_handler(Arc::new(GhostHandler { port: weak.clone() }));
            let proxy = Pad::new(format!("proxy-chain{}", chain.id()), PadDirection::Sink);
            proxy.set_handler(Arc::new(ProxyHandler { port: weak.clone() }));
            proxy.set_active(true);
            Self {
                bin: Arc::downgrade(bin),
                ghost,
                proxy,
                state: Mutex::new(TerminusState {
                    chain: Arc::downgrade(chain),
                    ..TerminusState::default()
                }),
            }
        })
    }

    pub fn ghost(&self) -> &Pad {
        &self.ghost
    }

    pub fn target(&self) -> Option<Pad> {
        self.state.lock().target.clone()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn is_exposed(&self) -> bool {
        self.state.lock().exposed
    }

    pub fn set_exposed(&self, exposed: bool) {
        self.state.lock().exposed = exposed;
    }

    /// Caps the ghost will carry: the negotiated ghost caps, else the
    /// target's.
    pub fn caps(&self) -> Option<Caps> {
        self.ghost.current_caps().or_else(|| self.target().and_then(|t| t.current_caps()))
    }

    pub fn active_stream(&self) -> Option<Arc<StreamInfo>> {
        self.state.lock().active_stream.clone()
    }

    pub fn stream_id(&self) -> String {
        self.active_stream()
            .map(|s| s.stream_id().to_string())
            .or_else(|| match self.target().and_then(|t| t.sticky_event(EventKind::StreamStart)) {
                Some(Event::StreamStart { stream_id, .. }) => Some(stream_id),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Points the proxy at a new internal source pad.
    ///
    /// The ghost's sticky cache is cleared and refilled from the new
    /// target's sticky events, run through the same stream-start and caps
    /// handling as live events.
    pub fn retarget(self: &Arc<Self>, new_target: Option<&Pad>) {
        let (old, old_probe, blocking) = {
            let mut state = self.state.lock();
            if state.target.as_ref() == new_target {
                return;
            }
            let old = std::mem::replace(&mut state.target, new_target.cloned());
            state.blocked = false;
            (old, state.block_probe.take(), state.blocking)
        };
        drop(old_probe);

        if let Some(old) = old {
            if old.peer().as_ref() == Some(&self.proxy) {
                old.unlink();
            }
        }
        self.ghost.clear_sticky_events();

        let Some(target) = new_target else {
            tracing::trace!(ghost = %self.ghost.name(), "terminus detached");
            return;
        };

        if let Err(e) = Pad::link(target, &self.proxy) {
            tracing::warn!(
                ghost = %self.ghost.name(),
                target = %target.name(),
                error = %e,
                "could not link terminus"
            );
            let mut state = self.state.lock();
            if state.target.as_ref() == Some(target) {
                state.target = None;
            }
            return;
        }

        if blocking {
            let probe = self.install_block_probe(target);
            self.state.lock().block_probe = Some(probe);
        }

        for event in target.sticky_events() {
            let event = self.handle_event(event);
            self.ghost.push_event(event);
        }
        target.mark_sticky_received();
        tracing::trace!(ghost = %self.ghost.name(), target = %target.name(), "terminus retargeted");
    }

    /// Blocks or unblocks data flow. Idempotent.
    pub fn set_blocked(self: &Arc<Self>, block: bool) {
        let Some(bin) = self.bin.upgrade() else {
            return;
        };
        let mut dyn_state = bin.dyn_state.lock();

        if block {
            if dyn_state.shutdown {
                return;
            }
            let target = {
                let mut state = self.state.lock();
                if state.blocking {
                    return;
                }
                state.blocking = true;
                state.target.clone()
            };
            if let Some(target) = target {
                let probe = self.install_block_probe(&target);
                self.state.lock().block_probe = Some(probe);
            }
            if !dyn_state.blocked.iter().any(|p| p.as_ptr() == Arc::as_ptr(self)) {
                dyn_state.blocked.push(Arc::downgrade(self));
            }
            tracing::debug!(ghost = %self.ghost.name(), "terminus blocking");
        } else {
            // Released threads must see a flushing ghost during shutdown.
            if dyn_state.shutdown {
                self.ghost.set_active(false);
            }
            let probe = {
                let mut state = self.state.lock();
                state.blocking = false;
                state.blocked = false;
                state.block_probe.take()
            };
            drop(probe);
            dyn_state.blocked.retain(|p| p.as_ptr() != Arc::as_ptr(self));
        }
    }

    /// The chain settled on this port as its terminus: activate and block.
    pub fn mark_active(self: &Arc<Self>, chain: &Arc<Chain>) {
        self.state.lock().chain = Arc::downgrade(chain);
        self.ghost.set_active(true);
        self.set_blocked(true);
    }

    fn install_block_probe(self: &Arc<Self>, target: &Pad) -> ProbeHandle {
        let weak = Arc::downgrade(self);
        target.add_probe(
            ProbeMask::BLOCK | ProbeMask::DATA_DOWNSTREAM | ProbeMask::QUERY_DOWNSTREAM,
            move |_pad, info| {
                if !info.data.is_serialized() {
                    return ProbeReturn::Pass;
                }
                if let ProbeData::Event(event) = info.data {
                    if event.is_sticky() && !matches!(event, Event::Eos) {
                        return ProbeReturn::Pass;
                    }
                }
                let Some(port) = weak.upgrade() else {
                    return ProbeReturn::Pass;
                };
                port.on_blocked();
                ProbeReturn::Ok
            },
        )
    }

    fn on_blocked(&self) {
        {
            let mut state = self.state.lock();
            if !state.blocking {
                return;
            }
            state.blocked = true;
        }
        tracing::debug!(ghost = %self.ghost.name(), "terminus blocked");
        if let Some(bin) = self.bin.upgrade() {
            bin.try_expose();
        }
    }

    /// Stream identity bookkeeping for events passing to the ghost.
    pub fn handle_event(&self, event: Event) -> Event {
        match event {
            Event::StreamStart { stream_id, group_id, stream } => {
                let mut state = self.state.lock();
                let info = match stream {
                    Some(info) => info,
                    None => match &state.active_stream {
                        Some(active) if active.stream_id() == stream_id => Arc::clone(active),
                        _ => {
                            let caps = state
                                .target
                                .as_ref()
                                .and_then(Pad::current_caps)
                                .or_else(|| {
                                    state.chain.upgrade().and_then(|c| c.start_caps().cloned())
                                });
                            let tags = state
                                .target
                                .as_ref()
                                .and_then(|t| t.sticky_event(EventKind::Tag));
                            let tags = match tags {
                                Some(Event::Tag(tags)) => tags,
                                _ => TagList::new(),
                            };
                            Arc::new(StreamInfo::new(stream_id.clone(), caps, tags))
                        },
                    },
                };
                state.active_stream = Some(Arc::clone(&info));
                Event::StreamStart { stream_id, group_id, stream: Some(info) }
            },
            Event::Caps(caps) => {
                if let Some(info) = self.state.lock().active_stream.as_ref() {
                    info.set_caps(caps.clone());
                }
                Event::Caps(caps)
            },
            Event::Tag(tags) => {
                if let Some(info) = self.state.lock().active_stream.as_ref() {
                    info.merge_tags(&tags);
                }
                Event::Tag(tags)
            },
            other => other,
        }
    }
}

impl std::fmt::Debug for TerminusPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TerminusPort")
            .field("ghost", &self.ghost.name())
            .field("target", &state.target.as_ref().map(Pad::name))
            .field("blocked", &state.blocked)
            .field("exposed", &state.exposed)
            .finish_non_exhaustive()
    }
}
