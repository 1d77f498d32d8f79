// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! DecodeKit Core - Fundamental types for building auto-plugged media chains.
//!
//! This crate defines the collaborator framework the decode engine drives:
//!
//! ## Core Modules
//!
//! - [`caps`]: Capability descriptions (fixed/unfixed, intersect, subset)
//! - [`event`]: Buffers, events, queries and stream identity
//! - [`pad`]: Linkable endpoints with sticky events, probes and stream locks
//! - [`signal`]: Synchronous signals with RAII handles
//! - [`stage`]: Processing stages, their state machine and pad signals
//! - [`registry`]: Stage factories, ranks and type finders
//! - [`error`]: Error types and handling
//!
//! ## Quick Start
//!
//! ```ignore
//! use decodekit_core::{Caps, PadTemplate, PadPresence, StageFactory, StageImpl, StageRegistry};
//! use decodekit_core::registry::rank;
//!
//! struct Passthrough;
//! impl StageImpl for Passthrough {}
//!
//! let registry = StageRegistry::new();
//! registry.register(StageFactory::new(
//!     "mpegaudioparse",
//!     "Codec/Parser/Audio",
//!     rank::PRIMARY,
//!     vec![
//!         PadTemplate::sink("audio/mpeg".parse()?),
//!         PadTemplate::src("src", PadPresence::Always, "audio/mpeg, parsed=true".parse()?),
//!     ],
//!     || Ok(Box::new(Passthrough)),
//! ));
//! ```

// Module declarations
pub mod caps;
pub mod error;
pub mod event;
pub mod pad;
pub mod registry;
pub mod signal;
pub mod stage;

// Convenience re-exports for commonly used types

// Error handling
pub use error::{DecodeKitError, Result};

// Caps and data flow
pub use caps::{Caps, FieldValue, Structure};
pub use event::{Buffer, Event, EventKind, FlowReturn, Query, StreamInfo, StreamType, TagList};

// Pads and stages
pub use pad::{
    Pad, PadDirection, PadHandler, PadLinkError, PadPresence, PadTemplate, ProbeHandle, ProbeInfo,
    ProbeMask, ProbeReturn, WeakPad,
};
pub use signal::{Signal, SignalHandle};
pub use stage::{Stage, StageImpl, StageState, StateChange, WeakStage};

// Registry and factory
pub use registry::{Klass, StageFactory, StageRegistry};
