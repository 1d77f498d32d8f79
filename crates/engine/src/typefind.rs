// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The typefind stage: detects the media type of an unknown byte stream.
//!
//! Until the type is known every buffer is accumulated and run through the
//! registry's type finders. Fixed caps arriving from upstream (or forced via
//! configuration) short-circuit detection. Once a type is found, `have_type`
//! fires *before* anything is pushed downstream, so the bin can plug a chain
//! behind the source pad first.

use crate::config::DecodeBinConfig;
use bytes::BytesMut;
use decodekit_core::registry::{probability, rank};
use decodekit_core::{
    Buffer, Caps, Event, EventKind, FlowReturn, Pad, PadPresence, PadTemplate, Result, Signal,
    SignalHandle, Stage, StageFactory, StageImpl, StageRegistry, StateChange,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct TypeFindState {
    found: Option<Caps>,
    errored: bool,
    data: BytesMut,
    /// Sticky events seen before the type was known, replayed afterwards.
    stashed: Vec<Event>,
}

pub struct TypeFindStage {
    registry: Arc<StageRegistry>,
    force_caps: Option<Caps>,
    max_bytes: usize,
    state: Mutex<TypeFindState>,
    have_type: Signal<(u32, Caps)>,
    error: Signal<String>,
}

impl TypeFindStage {
    fn new(registry: Arc<StageRegistry>, force_caps: Option<Caps>, max_bytes: usize) -> Self {
        Self {
            registry,
            force_caps,
            max_bytes,
            state: Mutex::new(TypeFindState::default()),
            have_type: Signal::new(),
            error: Signal::new(),
        }
    }

    /// The type the current stream was detected as.
    pub fn found_caps(&self) -> Option<Caps> {
        self.state.lock().found.clone()
    }

    /// Fires once per stream with the probability and the detected caps.
    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_have_type<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(u32, &Caps) + Send + Sync + 'static,
    {
        self.have_type.connect(move |(prob, caps)| f(*prob, caps))
    }

    /// Fires when the stream type cannot be determined.
    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect_error<F>(&self, f: F) -> SignalHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.error.connect(move |message| f(message))
    }

    fn stash(&self, event: Event) {
        let mut state = self.state.lock();
        let kind = event.kind();
        state.stashed.retain(|e| e.kind() != kind);
        state.stashed.push(event);
    }

    fn fail(&self, stage: &Stage, message: String) -> FlowReturn {
        {
            let mut state = self.state.lock();
            if state.errored {
                return FlowReturn::Error;
            }
            state.errored = true;
        }
        tracing::warn!(stage = %stage.name(), %message, "type detection failed");
        self.error.emit(&message);
        FlowReturn::Error
    }

    /// Announces the type, then pushes the stream head downstream.
    fn type_found(&self, stage: &Stage, prob: u32, caps: Caps) -> FlowReturn {
        let (stashed, data) = {
            let mut state = self.state.lock();
            if state.found.is_some() {
                return FlowReturn::Ok;
            }
            state.found = Some(caps.clone());
            (std::mem::take(&mut state.stashed), state.data.split().freeze())
        };
        tracing::debug!(
            stage = %stage.name(),
            probability = prob,
            %caps,
            buffered = data.len(),
            "type found"
        );
        self.have_type.emit(&(prob, caps.clone()));

        let Some(src) = stage.static_pad("src") else {
            return FlowReturn::Error;
        };
        let find = |kind: EventKind| stashed.iter().find(|e| e.kind() == kind).cloned();

        let stream_start = find(EventKind::StreamStart).unwrap_or_else(|| {
            let media_type = caps.media_type().unwrap_or("unknown");
            Event::stream_start(format!("{}/{media_type}", stage.name()))
        });
        src.push_event(stream_start);
        src.push_event(Event::Caps(caps));
        src.push_event(find(EventKind::Segment).unwrap_or(Event::Segment { start: 0 }));
        if let Some(tags) = find(EventKind::Tag) {
            src.push_event(tags);
        }

        if data.is_empty() {
            FlowReturn::Ok
        } else {
            src.push(Buffer::new(data))
        }
    }

    fn forward_event(stage: &Stage, event: Event) -> bool {
        stage.static_pad("src").is_some_and(|src| src.push_event(event))
    }
}

impl StageImpl for TypeFindStage {
    fn change_state(&self, _stage: &Stage, transition: StateChange) -> Result<()> {
        if transition == StateChange::PausedToReady {
            *self.state.lock() = TypeFindState::default();
        }
        Ok(())
    }

    fn sink_event(&self, stage: &Stage, _pad: &Pad, event: Event) -> bool {
        if self.state.lock().found.is_some() {
            return Self::forward_event(stage, event);
        }

        match event {
            Event::Caps(caps) => {
                if caps.is_fixed() {
                    let caps = self.force_caps.clone().unwrap_or(caps);
                    return self.type_found(stage, probability::MAXIMUM, caps).is_ok();
                }
                true
            },
            Event::Eos => {
                let data = self.state.lock().data.clone().freeze();
                let found = self.force_caps.clone().map(|c| (probability::MAXIMUM, c)).or_else(|| {
                    if data.is_empty() {
                        None
                    } else {
                        self.registry.typefind(&data)
                    }
                });
                match found {
                    Some((prob, caps)) => {
                        self.type_found(stage, prob, caps);
                        Self::forward_event(stage, Event::Eos)
                    },
                    None => {
                        self.fail(stage, "could not determine type of stream".to_string());
                        false
                    },
                }
            },
            event @ (Event::StreamStart { .. } | Event::Segment { .. } | Event::Tag(_)) => {
                self.stash(event);
                true
            },
            Event::FlushStart | Event::FlushStop => Self::forward_event(stage, event),
            Event::Gap { .. } => true,
        }
    }

    fn chain(&self, stage: &Stage, _pad: &Pad, buffer: Buffer) -> FlowReturn {
        let data = {
            let mut state = self.state.lock();
            if state.found.is_some() {
                drop(state);
                return stage.static_pad("src").map_or(FlowReturn::Error, |src| src.push(buffer));
            }
            if state.errored {
                return FlowReturn::Error;
            }
            state.data.extend_from_slice(&buffer.data);
            state.data.clone().freeze()
        };

        if let Some(caps) = self.force_caps.clone() {
            return self.type_found(stage, probability::MAXIMUM, caps);
        }

        let exhausted = data.len() >= self.max_bytes;
        match self.registry.typefind(&data) {
            Some((prob, caps)) if prob >= probability::LIKELY || exhausted => {
                self.type_found(stage, prob, caps)
            },
            _ if exhausted => self.fail(
                stage,
                format!("could not determine type of stream after {} bytes", data.len()),
            ),
            _ => FlowReturn::Ok,
        }
    }
}

/// Creates the bin's typefind stage.
pub(crate) fn create(registry: Arc<StageRegistry>, config: &DecodeBinConfig) -> Result<Stage> {
    let force_caps = config.sink_caps.clone();
    let max_bytes = config.typefind_max_bytes;
    let factory = Arc::new(
        StageFactory::new(
            "typefind",
            "Generic",
            rank::NONE,
            vec![
                PadTemplate::sink(Caps::new_any()),
                PadTemplate::src("src", PadPresence::Always, Caps::new_any()),
            ],
            move || {
                let imp = TypeFindStage::new(Arc::clone(&registry), force_caps.clone(), max_bytes);
                Ok(Box::new(imp) as Box<dyn StageImpl>)
            },
        )
        .with_description("Detects the media type of a byte stream"),
    );
    factory.create(Some("typefind"))
}
