// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared constants for the decode engine.
//!
//! Config structs reference these so defaults stay consistent across the
//! codebase.

// === Type detection ===

/// Default number of bytes the typefind stage buffers before giving up.
///
/// Most container signatures sit in the first few hundred bytes; 4KB also
/// covers ID3v2 headers in front of MPEG audio.
pub const DEFAULT_TYPEFIND_MAX_BYTES: usize = 4096;

/// Caps on which auto-plugging stops: decoded audio, video and text, plus the
/// subpicture formats renderers consume directly.
pub const DEFAULT_RAW_CAPS: &str =
    "video/x-raw; audio/x-raw; text/x-raw; subpicture/x-dvd; subpicture/x-pgs";

// === Exposure ===

/// Name template of exposed source pads; `%u` is the exposure index.
pub const EXPOSED_PAD_TEMPLATE: &str = "src_%u";

// === Telemetry ===

/// OpenTelemetry meter name.
pub const METER_NAME: &str = "decodekit_engine";

/// Formats the public name of the `index`-th exposed pad.
pub fn exposed_pad_name(index: u32) -> String {
    EXPOSED_PAD_TEMPLATE.replace("%u", &index.to_string())
}
