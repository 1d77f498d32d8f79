// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Extension points for embedding applications.

use decodekit_core::{Caps, Pad, StageFactory};

/// Verdict of [`AutoplugHooks::autoplug_select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplugSelect {
    /// Try to attach the candidate.
    Try,
    /// Stop plugging and expose the pad with its current caps.
    Expose,
    /// Skip this candidate.
    Skip,
}

/// Synchronous callbacks invoked from streaming threads while chains are
/// being built. Implementations must not call back into the bin.
pub trait AutoplugHooks: Send + Sync {
    /// Whether to keep plugging behind `pad` with fixed `caps`. `raw_caps`
    /// is the configured stop set; by default plugging stops on it.
    fn autoplug_continue(&self, _pad: &Pad, caps: &Caps, raw_caps: &Caps) -> bool {
        !caps.is_subset(raw_caps)
    }

    /// Consulted once per candidate, in finder order.
    fn autoplug_select(&self, _pad: &Pad, _caps: &Caps, _factory: &StageFactory) -> AutoplugSelect {
        AutoplugSelect::Try
    }

    /// A pad is being exposed. Called while the exposure batch is published
    /// so the embedder can link it before data flows.
    fn pad_added(&self, _pad: &Pad) {}
}

/// Hooks with every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl AutoplugHooks for DefaultHooks {}
