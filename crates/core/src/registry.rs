// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Stage factory registry and discovery.
//!
//! This module provides the factory pattern for creating stages:
//! - [`StageRegistry`]: central registry of every available stage factory and
//!   type finder, with a change cookie bumped on every mutation
//! - [`StageFactory`]: name, klass, rank, pad templates and constructor
//! - [`FactoryDefinition`]: serializable factory metadata

use crate::caps::Caps;
use crate::error::{DecodeKitError, Result};
use crate::pad::{PadDirection, PadPresence, PadTemplate};
use crate::stage::{Stage, StageImpl};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Factory ranks. Factories below [`rank::MARGINAL`] are never auto-plugged.
pub mod rank {
    pub const NONE: u32 = 0;
    pub const MARGINAL: u32 = 64;
    pub const SECONDARY: u32 = 128;
    pub const PRIMARY: u32 = 256;
}

/// Type-finder probabilities.
pub mod probability {
    pub const MINIMUM: u32 = 1;
    pub const POSSIBLE: u32 = 50;
    pub const LIKELY: u32 = 80;
    pub const NEARLY_CERTAIN: u32 = 99;
    pub const MAXIMUM: u32 = 100;
}

/// Slash-separated classification, e.g. `Codec/Parser/Converter/Video`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Klass(String);

impl Klass {
    pub fn new(klass: impl Into<String>) -> Self {
        Self(klass.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has(&self, part: &str) -> bool {
        self.0.split('/').any(|p| p == part)
    }

    pub fn is_parser(&self) -> bool {
        self.has("Parser")
    }

    /// Multiplexer-class: splits one input into several streams.
    pub fn is_demuxer(&self) -> bool {
        self.has("Demuxer")
    }

    pub fn is_decoder(&self) -> bool {
        self.has("Decoder")
    }

    pub fn is_converter(&self) -> bool {
        self.has("Converter")
    }

    /// Parsers that may also convert between formats; their output caps can
    /// stay unfixed and need a capsfilter.
    pub fn is_parser_converter(&self) -> bool {
        self.is_parser() && self.is_converter()
    }
}

impl fmt::Display for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds a stage implementation.
pub type StageConstructor = Arc<dyn Fn() -> Result<Box<dyn StageImpl>> + Send + Sync>;

/// Describes and instantiates one kind of stage.
pub struct StageFactory {
    name: String,
    klass: Klass,
    rank: u32,
    templates: Vec<PadTemplate>,
    description: Option<String>,
    constructor: StageConstructor,
    instances: AtomicU32,
}

impl StageFactory {
    pub fn new<F>(
        name: impl Into<String>,
        klass: impl Into<String>,
        rank: u32,
        templates: Vec<PadTemplate>,
        constructor: F,
    ) -> Self
    where
        F: Fn() -> Result<Box<dyn StageImpl>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            klass: Klass::new(klass),
            rank,
            templates,
            description: None,
            constructor: Arc::new(constructor),
            instances: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn klass(&self) -> &Klass {
        &self.klass
    }

    pub const fn rank(&self) -> u32 {
        self.rank
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn templates(&self) -> &[PadTemplate] {
        &self.templates
    }

    pub fn sink_templates(&self) -> impl Iterator<Item = &PadTemplate> {
        self.templates.iter().filter(|t| t.direction == PadDirection::Sink)
    }

    pub fn src_templates(&self) -> impl Iterator<Item = &PadTemplate> {
        self.templates.iter().filter(|t| t.direction == PadDirection::Src)
    }

    /// Some sink template overlaps `caps`.
    pub fn can_sink_any_caps(&self, caps: &Caps) -> bool {
        self.sink_templates().any(|t| t.caps.can_intersect(caps))
    }

    /// Some sink template covers all of `caps`.
    pub fn can_sink_all_caps(&self, caps: &Caps) -> bool {
        self.sink_templates().any(|t| caps.is_subset(&t.caps))
    }

    /// Stages of this factory may add source pads at runtime.
    pub fn has_dynamic_src_pads(&self) -> bool {
        self.src_templates().any(|t| t.presence == PadPresence::Sometimes)
    }

    /// Union of every source template's caps.
    pub fn src_caps(&self) -> Caps {
        let mut caps = Caps::new_empty();
        for t in self.src_templates() {
            caps.merge(t.caps.clone());
        }
        caps
    }

    /// Instantiates a stage. Without an explicit name the stage is named
    /// after the factory plus an instance counter (`mpegaudioparse0`).
    pub fn create(self: &Arc<Self>, name: Option<&str>) -> Result<Stage> {
        let imp = (self.constructor)()
            .map_err(|e| {
                DecodeKitError::Attachment(format!("could not construct {}: {e}", self.name))
            })?;
        let name = name.map_or_else(
            || format!("{}{}", self.name, self.instances.fetch_add(1, Ordering::Relaxed)),
            str::to_string,
        );
        Stage::new(name, Arc::clone(self), imp)
    }

    pub fn definition(&self) -> FactoryDefinition {
        FactoryDefinition {
            name: self.name.clone(),
            klass: self.klass.0.clone(),
            rank: self.rank,
            description: self.description.clone(),
            templates: self
                .templates
                .iter()
                .map(|t| TemplateDefinition {
                    name: t.name_template.clone(),
                    direction: match t.direction {
                        PadDirection::Src => "src",
                        PadDirection::Sink => "sink",
                    },
                    presence: match t.presence {
                        PadPresence::Always => "always",
                        PadPresence::Sometimes => "sometimes",
                        PadPresence::Request => "request",
                    },
                    caps: t.caps.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for StageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFactory")
            .field("name", &self.name)
            .field("klass", &self.klass)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// A serializable representation of a factory for inspection tooling.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryDefinition {
    pub name: String,
    pub klass: String,
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub templates: Vec<TemplateDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub direction: &'static str,
    pub presence: &'static str,
    pub caps: Caps,
}

/// Inspects the first bytes of a stream; returns a probability and caps.
pub type TypeFindFn = Arc<dyn Fn(&[u8]) -> Option<(u32, Caps)> + Send + Sync>;

#[derive(Clone)]
pub struct TypeFinder {
    pub name: String,
    pub rank: u32,
    pub find: TypeFindFn,
}

#[derive(Default)]
struct RegistryInner {
    factories: IndexMap<String, Arc<StageFactory>>,
    typefinders: Vec<TypeFinder>,
}

/// The StageRegistry holds every stage factory the engine can plug.
#[derive(Default)]
pub struct StageRegistry {
    inner: RwLock<RegistryInner>,
    cookie: AtomicU64,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<StageRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new()))
    }

    /// Registers a factory, replacing any factory of the same name.
    pub fn register(&self, factory: StageFactory) -> Arc<StageFactory> {
        let factory = Arc::new(factory);
        let replaced = self
            .inner
            .write()
            .factories
            .insert(factory.name().to_string(), Arc::clone(&factory))
            .is_some();
        self.cookie.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            factory = %factory.name(),
            klass = %factory.klass(),
            rank = factory.rank(),
            replaced,
            "registered stage factory"
        );
        factory
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.write().factories.shift_remove(name).is_some();
        if removed {
            self.cookie.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Changes every time the factory set changes.
    pub fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::SeqCst)
    }

    pub fn find(&self, name: &str) -> Option<Arc<StageFactory>> {
        self.inner.read().factories.get(name).cloned()
    }

    pub fn factories(&self) -> Vec<Arc<StageFactory>> {
        self.inner.read().factories.values().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<FactoryDefinition> {
        self.inner.read().factories.values().map(|f| f.definition()).collect()
    }

    /// Instantiates a stage by factory name.
    pub fn create(&self, factory_name: &str, name: Option<&str>) -> Result<Stage> {
        let factory = self
            .find(factory_name)
            .ok_or_else(|| DecodeKitError::NotFound(format!("stage factory '{factory_name}'")))?;
        factory.create(name)
    }

    pub fn register_typefinder<F>(&self, name: impl Into<String>, rank: u32, find: F)
    where
        F: Fn(&[u8]) -> Option<(u32, Caps)> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        inner.typefinders.push(TypeFinder { name: name.into(), rank, find: Arc::new(find) });
        inner.typefinders.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.name.cmp(&b.name)));
    }

    /// Runs type finders by rank and returns the most probable result.
    pub fn typefind(&self, data: &[u8]) -> Option<(u32, Caps)> {
        let finders = self.inner.read().typefinders.clone();
        let mut best: Option<(u32, Caps)> = None;
        for finder in finders {
            let Some((prob, caps)) = (finder.find)(data) else {
                continue;
            };
            if best.as_ref().is_none_or(|(p, _)| prob > *p) {
                tracing::trace!(typefinder = %finder.name, prob, %caps, "type suggested");
                best = Some((prob, caps));
            }
            if prob >= probability::MAXIMUM {
                break;
            }
        }
        best
    }
}
