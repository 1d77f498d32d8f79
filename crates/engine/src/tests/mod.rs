// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Unit tests for the engine crate.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod scenarios;

use crate::{AutoplugHooks, AutoplugSelect, BinEvent, DecodeBin, DecodeBinConfig};
use decodekit_core::{
    Buffer, Caps, Event, FlowReturn, Pad, PadDirection, PadHandler, Stage, StageFactory,
    StageRegistry, StageState,
};
use parking_lot::Mutex;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Records everything delivered to a sink pad.
#[derive(Default)]
pub struct Collector {
    pub events: Mutex<Vec<Event>>,
    pub buffers: Mutex<Vec<Buffer>>,
}

impl PadHandler for Collector {
    fn event(&self, _pad: &Pad, event: Event) -> bool {
        self.events.lock().push(event);
        true
    }

    fn chain(&self, _pad: &Pad, buffer: Buffer) -> FlowReturn {
        self.buffers.lock().push(buffer);
        FlowReturn::Ok
    }
}

/// Links every exposed pad to a [`Collector`], optionally steering plugging.
#[derive(Default)]
pub struct TestHooks {
    /// Stop plugging once the caps carry this field.
    pub stop_on_field: Option<&'static str>,
    /// Never try this factory.
    pub skip_factory: Option<&'static str>,
    /// Keep plugging even on raw caps.
    pub plug_raw: bool,
    pub linked: Mutex<Vec<Linked>>,
}

/// An exposed pad and the sink keeping its link alive.
pub struct Linked {
    pub pad: Pad,
    _sink: Pad,
    pub collector: Arc<Collector>,
}

impl TestHooks {
    pub fn collector(&self, pad_name: &str) -> Arc<Collector> {
        self.linked
            .lock()
            .iter()
            .find(|l| l.pad.name() == pad_name)
            .map(|l| Arc::clone(&l.collector))
            .expect("pad was never linked")
    }

    pub fn linked_caps(&self) -> Vec<(String, Option<Caps>)> {
        self.linked.lock().iter().map(|l| (l.pad.name(), l.pad.current_caps())).collect()
    }
}

impl AutoplugHooks for TestHooks {
    fn autoplug_continue(&self, _pad: &Pad, caps: &Caps, raw_caps: &Caps) -> bool {
        if !self.plug_raw && caps.is_subset(raw_caps) {
            return false;
        }
        self.stop_on_field
            .is_none_or(|field| caps.structure(0).is_none_or(|s| s.get(field).is_none()))
    }

    fn autoplug_select(&self, _pad: &Pad, _caps: &Caps, factory: &StageFactory) -> AutoplugSelect {
        if self.skip_factory == Some(factory.name()) {
            AutoplugSelect::Skip
        } else {
            AutoplugSelect::Try
        }
    }

    fn pad_added(&self, pad: &Pad) {
        let collector = Arc::new(Collector::default());
        let sink = Pad::new(format!("{}-collector", pad.name()), PadDirection::Sink);
        sink.set_handler(collector.clone());
        sink.set_active(true);
        Pad::link(pad, &sink).unwrap();
        self.linked.lock().push(Linked { pad: pad.clone(), _sink: sink, collector });
    }
}

/// A playing bin fed from an upstream test pad.
pub struct Harness {
    pub bin: DecodeBin,
    pub hooks: Arc<TestHooks>,
    pub events: mpsc::UnboundedReceiver<BinEvent>,
    pub upstream: Pad,
}

impl Harness {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self::build(registry, DecodeBinConfig::default(), TestHooks::default())
    }

    pub fn build(registry: Arc<StageRegistry>, config: DecodeBinConfig, hooks: TestHooks) -> Self {
        init_tracing();
        let hooks = Arc::new(hooks);
        let bin = DecodeBin::with_hooks(registry, config, hooks.clone()).unwrap();
        let events = bin.subscribe_events();
        bin.set_state(StageState::Playing).unwrap();

        let upstream = Pad::new("upstream", PadDirection::Src);
        upstream.set_active(true);
        Pad::link(&upstream, &bin.sink_pad()).unwrap();
        Self { bin, hooks, events, upstream }
    }

    pub fn push(&self, data: &'static [u8]) -> FlowReturn {
        self.upstream.push(Buffer::new(data))
    }

    pub fn drain_events(&mut self) -> Vec<BinEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn pad_names(&self) -> Vec<String> {
        self.bin.src_pads().iter().map(Pad::name).collect()
    }

    pub fn stage(&self, factory: &str) -> Stage {
        self.bin
            .stages()
            .into_iter()
            .find(|s| s.factory_name() == factory)
            .expect("stage not plugged")
    }

    pub fn stage_factories(&self) -> Vec<String> {
        self.bin.stages().iter().map(|s| s.factory_name().to_string()).collect()
    }
}

pub fn count<F: Fn(&BinEvent) -> bool>(events: &[BinEvent], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Pushes one buffer from a fresh streaming thread.
pub fn spawn_push(pad: Pad, data: &'static [u8]) -> std_mpsc::Receiver<FlowReturn> {
    let (tx, rx) = std_mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(pad.push(Buffer::new(data)));
    });
    rx
}

pub fn join_push(rx: &std_mpsc::Receiver<FlowReturn>) -> FlowReturn {
    rx.recv_timeout(TIMEOUT).expect("streaming thread never returned")
}
