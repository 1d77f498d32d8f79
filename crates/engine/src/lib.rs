// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: The auto-plugging decode bin for DecodeKit.
//!
//! A [`DecodeBin`] takes a byte stream of unknown type, detects it, and
//! plugs demuxers and parsers from a [`StageRegistry`](decodekit_core::StageRegistry)
//! until every elementary stream reaches a decodable or raw format. The
//! finished streams are exposed together as `src_N` pads.
//!
//! ## Modules
//!
//! - [`bin`]: the bin controller, atomic exposure and teardown
//! - [`config`]: bin configuration (YAML/JSON, JSON schema)
//! - [`events`]: notifications posted to subscribers
//! - [`finder`]: candidate lookup over the registry
//! - [`hooks`]: application extension points
//! - [`typefind`]: the type detection stage
//! - [`capsfilter`]: the caps restriction stage

// --- Public Modules ---

pub mod bin;
pub mod capsfilter;
pub mod config;
pub mod constants;
pub mod events;
pub mod finder;
pub mod hooks;
pub mod typefind;

mod chain;
mod metrics;
mod terminus;

// Re-exports
pub use bin::DecodeBin;
pub use config::DecodeBinConfig;
pub use events::BinEvent;
pub use finder::CandidateFinder;
pub use hooks::{AutoplugHooks, AutoplugSelect, DefaultHooks};

#[cfg(test)]
mod tests;
