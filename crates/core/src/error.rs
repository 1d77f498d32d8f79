// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for DecodeKit.
//!
//! Every failure the auto-plugging engine can run into while building a
//! processing chain maps to one of these variants. Most of them are recovered
//! locally (a failed candidate is rolled back and the next one is tried), so
//! they mostly surface in logs and diagnostics rather than to callers.

use thiserror::Error;

/// Main error type for DecodeKit operations.
#[derive(Debug, Error)]
pub enum DecodeKitError {
    /// No factory can handle the caps, or every candidate rejected them.
    ///
    /// Recorded on a dead chain and surfaced once as a missing-plugin
    /// notification. Never fatal to sibling branches.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// A specific candidate could not be attached.
    ///
    /// Examples:
    /// - Factory constructor failed
    /// - Linking the candidate's sink pad failed
    /// - State change to READY or PLAYING failed
    /// - The candidate refused the negotiated caps
    #[error("Attachment failed: {0}")]
    Attachment(String),

    /// A parser would be plugged behind itself.
    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    /// A framework invariant was violated, e.g. a pad was reported by a stage
    /// that is not the chain's current stage.
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    /// The bin is shutting down; the operation was abandoned.
    #[error("Shutting down")]
    Shutdown,

    /// A stage failed to change state.
    #[error("State change failed: {0}")]
    StateChange(String),

    /// Two pads could not be linked.
    #[error("Link failed: {0}")]
    Link(#[from] crate::pad::PadLinkError),

    /// A factory, pad or stage was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration or parameter validation error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Any other runtime failure.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience type alias for Results using `DecodeKitError`.
pub type Result<T> = std::result::Result<T, DecodeKitError>;

// Allow conversion from DecodeKitError to String for diagnostics
impl From<DecodeKitError> for String {
    fn from(err: DecodeKitError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime
impl From<String> for DecodeKitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for DecodeKitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
