// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end chain construction and exposure scenarios.

use super::stages::{self, add_stream, caps, start_stream};
use super::{count, join_push, spawn_push, wait_until, Harness, TestHooks};
use crate::chain::{Chain, PadAnalysis};
use crate::{BinEvent, DecodeBinConfig};
use decodekit_core::{Event, EventKind, FlowReturn, StageState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn media_type(caps: Option<&decodekit_core::Caps>) -> Option<String> {
    caps.and_then(|c| c.media_type()).map(str::to_string)
}

#[test]
fn test_single_stream_straight_to_decoder() {
    let mut h = Harness::new(stages::registry());

    assert_eq!(h.push(b"VORB-payload"), FlowReturn::Ok);

    assert_eq!(h.pad_names(), vec!["src_0"]);
    assert_eq!(h.bin.expose_calls(), 1);
    assert_eq!(h.bin.expose_batches(), 1);
    assert!(h.bin.stages().is_empty());

    let events = h.drain_events();
    assert!(matches!(
        &events[0],
        BinEvent::HaveType { caps, .. } if caps.media_type() == Some("audio/x-vorbis")
    ));
    assert_eq!(count(&events, |e| matches!(e, BinEvent::PadAdded { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 1);

    let collector = h.hooks.collector("src_0");
    let buffers = collector.buffers.lock();
    assert_eq!(buffers.len(), 1);
    assert_eq!(&buffers[0].data[..], b"VORB-payload");
    let kinds: Vec<EventKind> = collector.events.lock().iter().map(Event::kind).collect();
    assert_eq!(kinds, vec![EventKind::StreamStart, EventKind::Caps, EventKind::Segment]);
}

#[test]
fn test_parser_is_plugged_before_decoder() {
    let h = Harness::new(stages::registry());

    assert_eq!(h.push(b"MP3-frames"), FlowReturn::Ok);

    let root = h.bin.root_chain().unwrap();
    assert_eq!(root.stage_names(), vec!["mpegaudioparse"]);
    assert_eq!(h.stage_factories(), vec!["mpegaudioparse"]);
    assert_eq!(h.pad_names(), vec!["src_0"]);

    let (_, pad_caps) = &h.hooks.linked_caps()[0];
    let pad_caps = pad_caps.clone().unwrap();
    assert_eq!(
        pad_caps.structure(0).unwrap().get("parsed").map(ToString::to_string).as_deref(),
        Some("true")
    );

    // The stream identity follows the caps that actually reached the pad.
    let collector = h.hooks.collector("src_0");
    let events = collector.events.lock();
    let Some(Event::StreamStart { stream: Some(info), .. }) = events.first() else {
        panic!("first event must be a stream-start carrying stream info");
    };
    assert_eq!(info.caps(), Some(pad_caps));
}

#[test]
fn test_static_demuxer_exposes_both_streams_together() {
    let mut h = Harness::new(stages::registry());

    assert_eq!(h.push(b"TS-container"), FlowReturn::Ok);
    let root = h.bin.root_chain().unwrap();
    let children = root.children();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.terminus().is_some()));
    assert!(h.bin.src_pads().is_empty());

    let demux = h.stage("tsdemux");
    let video = spawn_push(demux.static_pad("video_0").unwrap(), b"frame");
    wait_until("video branch to block", || {
        children.iter().filter(|c| c.terminus().is_some_and(|t| t.is_blocked())).count() == 1
    });
    assert!(h.bin.src_pads().is_empty());
    assert_eq!(h.bin.expose_batches(), 0);

    let audio = spawn_push(demux.static_pad("audio_0").unwrap(), b"sample");
    assert_eq!(join_push(&video), FlowReturn::Ok);
    assert_eq!(join_push(&audio), FlowReturn::Ok);

    assert_eq!(h.bin.expose_batches(), 1);
    let linked: Vec<(String, Option<String>)> = h
        .hooks
        .linked_caps()
        .into_iter()
        .map(|(name, caps)| (name, media_type(caps.as_ref())))
        .collect();
    assert_eq!(
        linked,
        vec![
            ("src_0".to_string(), Some("video/x-theora".to_string())),
            ("src_1".to_string(), Some("audio/x-vorbis".to_string())),
        ]
    );

    let events = h.drain_events();
    assert_eq!(count(&events, |e| matches!(e, BinEvent::PadAdded { .. })), 2);
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 1);
    let last_pad_added =
        events.iter().rposition(|e| matches!(e, BinEvent::PadAdded { .. })).unwrap();
    let no_more_pads = events.iter().position(|e| matches!(e, BinEvent::NoMorePads)).unwrap();
    assert!(last_pad_added < no_more_pads);
}

#[test]
fn test_dynamic_demuxer_waits_for_every_stream() {
    let mut h = Harness::new(stages::registry());

    assert_eq!(h.push(b"MKV-container"), FlowReturn::Ok);
    let demux = h.stage("matroskademux");
    let root = h.bin.root_chain().unwrap();

    let audio_pad = add_stream(&demux, "src_0");
    let first = root.children()[0].clone();
    assert_eq!(first.pending_count(), 1);
    start_stream(&audio_pad, "mkv/audio", &caps("audio/x-vorbis"));
    assert_eq!(first.pending_count(), 0);
    assert!(first.terminus().is_some());

    let audio = spawn_push(audio_pad, b"sample");
    wait_until("audio branch to block", || first.terminus().is_some_and(|t| t.is_blocked()));
    assert!(!root.is_complete());
    assert!(h.bin.src_pads().is_empty());

    thread::sleep(Duration::from_millis(50));
    let video_pad = add_stream(&demux, "src_1");
    start_stream(&video_pad, "mkv/video", &caps("video/x-theora"));
    let video = spawn_push(video_pad, b"frame");
    wait_until("both branches to block", || {
        root.children().iter().all(|c| c.terminus().is_some_and(|t| t.is_blocked()))
    });
    assert!(h.bin.src_pads().is_empty(), "nothing may be exposed before no-more-pads");

    demux.emit_no_more_pads();
    assert_eq!(join_push(&audio), FlowReturn::Ok);
    assert_eq!(join_push(&video), FlowReturn::Ok);

    assert_eq!(h.bin.expose_batches(), 1);
    assert_eq!(h.pad_names(), vec!["src_0", "src_1"]);
    let events = h.drain_events();
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 1);
}

#[test]
fn test_parser_is_never_plugged_behind_itself() {
    let mut h = Harness::new(stages::registry());

    h.push(b"LOOP-data");

    let root = h.bin.root_chain().unwrap();
    assert_eq!(root.stage_names(), vec!["loopparse"]);
    assert!(root.is_dead());
    assert!(root.is_complete());
    assert_eq!(h.stage_factories(), vec!["loopparse"]);
    assert!(h.bin.src_pads().is_empty());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        BinEvent::MissingPlugin { caps, detail }
            if caps.media_type() == Some("application/x-loop") && detail.contains("loopparse")
    )));
    let no_plugins = count(&events, |e| {
        matches!(e, BinEvent::Error { message } if message.contains("no suitable plugins"))
    });
    assert_eq!(no_plugins, 1);
}

#[test]
fn test_refused_caps_roll_back_to_next_candidate() {
    let registry = stages::registry();
    stages::register_picky_parser(&registry);
    let h = Harness::new(registry);

    assert_eq!(h.push(b"MP3-frames"), FlowReturn::Ok);

    let root = h.bin.root_chain().unwrap();
    assert_eq!(root.stage_names(), vec!["mpegaudioparse"]);
    assert_eq!(h.stage_factories(), vec!["mpegaudioparse"]);
    assert_eq!(h.pad_names(), vec!["src_0"]);
}

#[test]
fn test_candidate_failing_to_start_is_unwound() {
    let registry = stages::registry();
    stages::register_broken_parser(&registry);
    let h = Harness::new(registry);

    assert_eq!(h.push(b"MP3-frames"), FlowReturn::Ok);

    let root = h.bin.root_chain().unwrap();
    assert_eq!(root.stage_names(), vec!["mpegaudioparse"]);
    assert_eq!(h.stage_factories(), vec!["mpegaudioparse"]);
    assert_eq!(h.pad_names(), vec!["src_0"]);
}

#[test]
fn test_capsfilter_narrows_parser_converter_output() {
    let h = Harness::new(stages::registry());

    assert_eq!(h.push(b"H264-nal-units"), FlowReturn::Ok);

    let root = h.bin.root_chain().unwrap();
    assert_eq!(root.stage_names(), vec!["h264parse"]);
    assert_eq!(h.stage_factories(), vec!["h264parse", "capsfilter"]);

    let (name, pad_caps) = h.hooks.linked_caps().remove(0);
    assert_eq!(name, "src_0");
    let pad_caps = pad_caps.unwrap();
    assert!(pad_caps.is_fixed());
    assert_eq!(pad_caps.structure(0).unwrap().get_str("stream-format"), Some("avc"));
}

#[test]
fn test_raw_caps_are_exposed_without_plugging() {
    let h = Harness::new(stages::registry());

    assert_eq!(h.push(b"RAW-pcm"), FlowReturn::Ok);

    assert!(h.bin.stages().is_empty());
    assert_eq!(h.pad_names(), vec!["src_0"]);
    let (_, pad_caps) = &h.hooks.linked_caps()[0];
    assert_eq!(media_type(pad_caps.as_ref()).as_deref(), Some("audio/x-raw"));
}

#[test]
fn test_unsupported_type_reports_once() {
    let mut h = Harness::new(stages::registry());

    h.push(b"UNKN-bytes");
    h.push(b"more-bytes");

    assert!(h.bin.src_pads().is_empty());
    let events = h.drain_events();
    assert_eq!(count(&events, |e| matches!(e, BinEvent::MissingPlugin { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, BinEvent::Error { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 0);
}

#[test]
fn test_missing_plugin_notification_can_be_disabled() {
    let config = DecodeBinConfig { post_missing_plugins: false, ..Default::default() };
    let mut h = Harness::build(stages::registry(), config, TestHooks::default());

    h.push(b"UNKN-bytes");

    let events = h.drain_events();
    assert_eq!(count(&events, |e| matches!(e, BinEvent::MissingPlugin { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, BinEvent::Error { .. })), 1);
}

#[test]
fn test_eos_before_caps_kills_the_branch() {
    let mut h = Harness::new(stages::registry());

    h.push(b"MKV-container");
    let demux = h.stage("matroskademux");
    let pad = add_stream(&demux, "src_0");
    pad.push_event(Event::stream_start("mkv/0"));
    pad.push_event(Event::Eos);

    let child = h.bin.root_chain().unwrap().children()[0].clone();
    assert!(child.is_dead());
    assert_eq!(child.pending_count(), 0);

    demux.emit_no_more_pads();
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        BinEvent::MissingPlugin { detail, .. } if detail == "stream ended before caps were fixed"
    )));
    assert_eq!(count(&events, |e| matches!(e, BinEvent::Error { .. })), 1);
}

#[test]
fn test_removed_pad_frees_its_branch() {
    let h = Harness::new(stages::registry());

    h.push(b"MKV-container");
    let demux = h.stage("matroskademux");
    let root = h.bin.root_chain().unwrap();
    let pad = add_stream(&demux, "src_0");
    assert_eq!(root.children().len(), 1);

    demux.remove_pad(&pad).unwrap();
    assert!(root.children().is_empty());
}

#[test]
fn test_block_and_unblock_are_idempotent() {
    let h = Harness::new(stages::registry());

    h.push(b"TS-container");
    assert_eq!(h.bin.blocked_count(), 2);

    let children = h.bin.root_chain().unwrap().children();
    let port = children[0].terminus().unwrap();
    port.set_blocked(true);
    port.set_blocked(true);
    assert_eq!(h.bin.blocked_count(), 2);

    port.set_blocked(false);
    port.set_blocked(false);
    assert_eq!(h.bin.blocked_count(), 1);
}

#[test]
fn test_completeness_is_monotonic_once_exposed() {
    let h = Harness::new(stages::registry());

    assert_eq!(h.push(b"VORB-payload"), FlowReturn::Ok);
    let root = h.bin.root_chain().unwrap();
    assert!(root.is_complete());

    // More data through an exposed, unblocked terminus.
    assert_eq!(h.push(b"VORB-more"), FlowReturn::Ok);
    assert!(root.is_complete());
    assert_eq!(h.bin.expose_batches(), 1);
}

#[test]
fn test_replayed_stream_start_keeps_stream_identity() {
    let h = Harness::new(stages::registry());

    h.push(b"TS-container");
    let demux = h.stage("tsdemux");
    let video = spawn_push(demux.static_pad("video_0").unwrap(), b"frame");
    let audio = spawn_push(demux.static_pad("audio_0").unwrap(), b"sample");
    assert_eq!(join_push(&video), FlowReturn::Ok);
    assert_eq!(join_push(&audio), FlowReturn::Ok);

    let ghost = h.bin.src_pads().into_iter().find(|p| p.name() == "src_0").unwrap();
    let stream_info = |pad: &decodekit_core::Pad| match pad.sticky_event(EventKind::StreamStart) {
        Some(Event::StreamStart { stream: Some(info), .. }) => info,
        other => panic!("unexpected stream-start {other:?}"),
    };
    let before = stream_info(&ghost);
    assert_eq!(before.stream_id(), "tsdemux0/video_0");

    demux.static_pad("video_0").unwrap().push_event(Event::stream_start("tsdemux0/video_0"));
    let after = stream_info(&ghost);
    assert!(Arc::ptr_eq(&before, &after));
}

#[test]
fn test_shutdown_releases_blocked_threads() {
    let mut h = Harness::new(stages::registry());

    h.push(b"TS-container");
    let demux = h.stage("tsdemux");
    let video = spawn_push(demux.static_pad("video_0").unwrap(), b"frame");
    let root = h.bin.root_chain().unwrap();
    wait_until("video branch to block", || {
        root.children().iter().any(|c| c.terminus().is_some_and(|t| t.is_blocked()))
    });

    h.bin.set_state(StageState::Ready).unwrap();
    assert_eq!(join_push(&video), FlowReturn::Flushing);

    assert!(h.bin.root_chain().is_none());
    assert!(h.bin.stages().is_empty());
    assert!(h.bin.src_pads().is_empty());
    let events = h.drain_events();
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 0);
}

#[test]
fn test_bin_restarts_after_ready() {
    let h = Harness::new(stages::registry());

    assert_eq!(h.push(b"VORB-payload"), FlowReturn::Ok);
    assert_eq!(h.pad_names(), vec!["src_0"]);

    h.bin.set_state(StageState::Ready).unwrap();
    assert!(h.bin.src_pads().is_empty());
    h.bin.set_state(StageState::Playing).unwrap();

    assert_eq!(h.push(b"MP3-frames"), FlowReturn::Ok);
    assert_eq!(h.pad_names(), vec!["src_0"]);
    assert_eq!(h.stage_factories(), vec!["mpegaudioparse"]);
}

#[test]
fn test_forced_sink_caps_skip_detection() {
    let config = DecodeBinConfig { sink_caps: Some(caps("audio/x-vorbis")), ..Default::default() };
    let h = Harness::build(stages::registry(), config, TestHooks::default());

    assert_eq!(h.push(b"no magic here"), FlowReturn::Ok);
    assert_eq!(h.pad_names(), vec!["src_0"]);
}

#[test]
fn test_autoplug_continue_can_stop_plugging() {
    let hooks = TestHooks { stop_on_field: Some("parsed"), ..Default::default() };
    let h = Harness::build(stages::registry(), DecodeBinConfig::default(), hooks);

    assert_eq!(h.push(b"MP3-frames"), FlowReturn::Ok);

    assert_eq!(h.stage_factories(), vec!["mpegaudioparse"]);
    let root = h.bin.root_chain().unwrap();
    let end_caps = root.end_caps().unwrap();
    assert!(end_caps.structure(0).unwrap().get("parsed").is_some());
    assert_eq!(h.pad_names(), vec!["src_0"]);
}

#[test]
fn test_autoplug_select_can_skip_candidates() {
    let hooks = TestHooks { skip_factory: Some("mpegaudioparse"), ..Default::default() };
    let mut h = Harness::build(stages::registry(), DecodeBinConfig::default(), hooks);

    h.push(b"MP3-frames");

    // Without the parser the decoder cannot take unparsed frames.
    assert!(h.bin.stages().is_empty());
    assert!(h.bin.root_chain().unwrap().is_dead());
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        BinEvent::MissingPlugin { detail, .. } if detail.contains("skipped by application")
    )));
}

#[test]
fn test_raw_caps_can_be_plugged_on_request() {
    let hooks = TestHooks { plug_raw: true, ..Default::default() };
    let mut h = Harness::build(stages::registry(), DecodeBinConfig::default(), hooks);

    h.push(b"RAW-pcm");

    // Nothing in the registry consumes raw audio, so the branch dies
    // instead of being exposed.
    assert!(h.bin.src_pads().is_empty());
    assert!(h.bin.root_chain().unwrap().is_dead());
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        BinEvent::MissingPlugin { caps, .. } if caps.media_type() == Some("audio/x-raw")
    )));
}

#[test]
fn test_concurrent_exposure_attempts_publish_one_batch() {
    let mut h = Harness::new(stages::registry());

    h.push(b"TS-container");
    let demux = h.stage("tsdemux");
    let done = AtomicBool::new(false);
    let bin = &h.bin;

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    bin.try_expose();
                    thread::yield_now();
                }
            });
        }

        let video = spawn_push(demux.static_pad("video_0").unwrap(), b"frame");
        let audio = spawn_push(demux.static_pad("audio_0").unwrap(), b"sample");
        assert_eq!(join_push(&video), FlowReturn::Ok);
        assert_eq!(join_push(&audio), FlowReturn::Ok);
        done.store(true, Ordering::SeqCst);
    });

    assert_eq!(h.bin.expose_batches(), 1);
    assert_eq!(h.pad_names(), vec!["src_0", "src_1"]);
    let events = h.drain_events();
    let added: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, BinEvent::PadAdded { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(added.len(), 2);
    assert_eq!(added[1], added[0] + 1, "pads of one batch must be announced together");
    assert!(matches!(events[added[1] + 1], BinEvent::NoMorePads));
    assert_eq!(count(&events, |e| matches!(e, BinEvent::NoMorePads)), 1);
}

#[test]
fn test_pad_from_foreign_stage_is_ignored() {
    let h = Harness::new(stages::registry());

    h.push(b"TS-container");
    let root = h.bin.root_chain().unwrap();
    let children_before = root.children();
    let stages_before = h.stage_factories();
    assert_eq!(children_before.len(), 2);

    let stray = stages::registry().create("tsdemux", None).unwrap();
    Chain::run_analysis(PadAnalysis {
        chain: Arc::clone(&root),
        stage: Some(stray.clone()),
        pad: stray.static_pad("video_0").unwrap(),
        caps: None,
    });

    let children_after = root.children();
    assert_eq!(children_after.len(), 2);
    assert!(children_before.iter().zip(&children_after).all(|(a, b)| Arc::ptr_eq(a, b)));
    assert_eq!(root.stage_names(), vec!["tsdemux"]);
    assert_eq!(h.stage_factories(), stages_before);
    assert!(root.is_complete());
}
