// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Capsfilter: restricts what a parser-converter may negotiate.

use decodekit_core::registry::rank;
use decodekit_core::{
    Caps, Event, Pad, PadDirection, PadPresence, PadTemplate, Result, Stage, StageFactory,
    StageImpl,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

pub struct CapsFilter {
    filter: Mutex<Caps>,
}

impl CapsFilter {
    pub fn filter(&self) -> Caps {
        self.filter.lock().clone()
    }

    pub fn set_filter(&self, caps: Caps) {
        *self.filter.lock() = caps;
    }
}

impl StageImpl for CapsFilter {
    fn sink_event(&self, stage: &Stage, _pad: &Pad, event: Event) -> bool {
        let event = match event {
            Event::Caps(caps) => {
                let filtered = caps.intersect(&self.filter());
                if filtered.is_empty() {
                    tracing::warn!(stage = %stage.name(), %caps, "caps rejected by filter");
                    return false;
                }
                Event::Caps(if filtered.is_fixed() { filtered } else { filtered.fixate() })
            },
            other => other,
        };
        stage.static_pad("src").is_some_and(|src| src.push_event(event))
    }

    fn query_caps(&self, stage: &Stage, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let opposite = match pad.direction() {
            PadDirection::Sink => stage.static_pad("src"),
            PadDirection::Src => stage.sink_pad(),
        };
        let caps = opposite
            .map_or_else(Caps::new_any, |p| p.peer_query_caps(None))
            .intersect(&self.filter());
        filter.map_or_else(|| caps.clone(), |f| f.intersect(&caps))
    }

    fn accept_caps(&self, _stage: &Stage, _pad: &Pad, caps: &Caps) -> bool {
        caps.can_intersect(&self.filter())
    }
}

fn factory() -> &'static Arc<StageFactory> {
    static FACTORY: OnceLock<Arc<StageFactory>> = OnceLock::new();
    FACTORY.get_or_init(|| {
        Arc::new(
            StageFactory::new(
                "capsfilter",
                "Generic",
                rank::NONE,
                vec![
                    PadTemplate::sink(Caps::new_any()),
                    PadTemplate::src("src", PadPresence::Always, Caps::new_any()),
                ],
                || {
                    Ok(Box::new(CapsFilter { filter: Mutex::new(Caps::new_any()) })
                        as Box<dyn StageImpl>)
                },
            )
            .with_description("Restricts the caps flowing through it"),
        )
    })
}

/// Creates a capsfilter restricted to `filter`.
pub(crate) fn create(filter: &Caps) -> Result<Stage> {
    let stage = factory().create(None)?;
    if let Some(imp) = stage.imp::<CapsFilter>() {
        imp.set_filter(filter.clone());
    }
    Ok(stage)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_src_caps_follow_upstream_and_filter() {
        let stage = create(&"video/x-h264, stream-format=avc".parse().unwrap()).unwrap();
        let upstream = Pad::from_template(
            &PadTemplate::src(
                "src",
                PadPresence::Always,
                "video/x-h264, stream-format={avc, byte-stream}".parse().unwrap(),
            ),
            "parser-src",
        );
        Pad::link(&upstream, &stage.sink_pad().unwrap()).unwrap();

        let caps = stage.static_pad("src").unwrap().query_caps(None);
        assert!(caps.is_fixed());
        assert_eq!(caps.structure(0).unwrap().get_str("stream-format"), Some("avc"));
    }

    #[test]
    fn test_accepts_only_overlapping_caps() {
        let stage = create(&"audio/mpeg, mpegversion=4".parse().unwrap()).unwrap();
        let sink = stage.sink_pad().unwrap();
        assert!(sink.query_accept_caps(&"audio/mpeg, mpegversion=4, channels=2".parse().unwrap()));
        assert!(!sink.query_accept_caps(&"audio/mpeg, mpegversion=1".parse().unwrap()));
    }
}
