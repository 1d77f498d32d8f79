// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Candidate finder: which factories can consume some caps, in what order.
//!
//! The auto-pluggable factory list (demuxers, parsers and decoders ranked
//! at least `MARGINAL`) is cached together with the registry cookie it was
//! computed from and rebuilt only when the cookie moves.

use decodekit_core::registry::rank;
use decodekit_core::{Caps, StageFactory, StageRegistry};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

struct CachedFactories {
    cookie: u64,
    factories: Arc<Vec<Arc<StageFactory>>>,
}

pub struct CandidateFinder {
    registry: Arc<StageRegistry>,
    cache: RwLock<Option<CachedFactories>>,
}

impl CandidateFinder {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry, cache: RwLock::new(None) }
    }

    /// Finder over [`StageRegistry::global`].
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<CandidateFinder> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(Arc::clone(StageRegistry::global())))
    }

    pub const fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Factories whose sink can accept `caps`: parsers first, then by rank
    /// (highest first), then by name.
    pub fn find(&self, caps: &Caps) -> Vec<Arc<StageFactory>> {
        self.autopluggable().iter().filter(|f| f.can_sink_any_caps(caps)).cloned().collect()
    }

    fn autopluggable(&self) -> Arc<Vec<Arc<StageFactory>>> {
        let cookie = self.registry.cookie();
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.cookie == cookie {
                return Arc::clone(&cached.factories);
            }
        }

        let mut factories: Vec<Arc<StageFactory>> = self
            .registry
            .factories()
            .into_iter()
            .filter(|f| {
                let k = f.klass();
                f.rank() >= rank::MARGINAL && (k.is_demuxer() || k.is_parser() || k.is_decoder())
            })
            .collect();
        factories.sort_by(|a, b| compare_factories(a, b));
        let factories = Arc::new(factories);

        tracing::debug!(cookie, count = factories.len(), "refreshed autopluggable factory list");
        *self.cache.write() = Some(CachedFactories { cookie, factories: Arc::clone(&factories) });
        factories
    }
}

fn compare_factories(a: &StageFactory, b: &StageFactory) -> Ordering {
    b.klass()
        .is_parser()
        .cmp(&a.klass().is_parser())
        .then_with(|| b.rank().cmp(&a.rank()))
        .then_with(|| a.name().cmp(b.name()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use decodekit_core::{PadPresence, PadTemplate, StageImpl};

    struct Nop;
    impl StageImpl for Nop {}

    fn factory(name: &str, klass: &str, rank: u32, sink: &str) -> StageFactory {
        StageFactory::new(
            name,
            klass,
            rank,
            vec![
                PadTemplate::sink(sink.parse().unwrap()),
                PadTemplate::src("src", PadPresence::Always, Caps::new_any()),
            ],
            || Ok(Box::new(Nop) as Box<dyn StageImpl>),
        )
    }

    fn names(list: &[Arc<StageFactory>]) -> Vec<&str> {
        list.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn test_parsers_first_then_rank_then_name() {
        let registry = Arc::new(StageRegistry::new());
        registry.register(factory("zdec", "Codec/Decoder/Audio", rank::PRIMARY, "audio/mpeg"));
        registry.register(factory("adec", "Codec/Decoder/Audio", rank::PRIMARY, "audio/mpeg"));
        registry.register(factory("lowparse", "Codec/Parser/Audio", rank::MARGINAL, "audio/mpeg"));
        registry.register(factory("secdec", "Codec/Decoder/Audio", rank::SECONDARY, "audio/mpeg"));
        registry.register(factory("hiddendec", "Codec/Decoder/Audio", rank::NONE, "audio/mpeg"));
        registry.register(factory("sink", "Sink/Audio", rank::PRIMARY, "audio/mpeg"));
        registry.register(factory("vdec", "Codec/Decoder/Video", rank::PRIMARY, "video/x-h264"));

        let finder = CandidateFinder::new(registry);
        let caps = Caps::new_simple("audio/mpeg");
        let first = finder.find(&caps);
        assert_eq!(names(&first), vec!["lowparse", "adec", "zdec", "secdec"]);
        assert_eq!(names(&finder.find(&caps)), names(&first));
    }

    #[test]
    fn test_cache_follows_registry_cookie() {
        let registry = Arc::new(StageRegistry::new());
        let finder = CandidateFinder::new(Arc::clone(&registry));
        let caps = Caps::new_simple("audio/mpeg");
        assert!(finder.find(&caps).is_empty());

        registry.register(factory("adec", "Codec/Decoder/Audio", rank::PRIMARY, "audio/mpeg"));
        assert_eq!(names(&finder.find(&caps)), vec!["adec"]);

        registry.unregister("adec");
        assert!(finder.find(&caps).is_empty());
    }
}
