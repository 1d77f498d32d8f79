// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration for [`DecodeBin`](crate::DecodeBin).

use crate::constants::{DEFAULT_RAW_CAPS, DEFAULT_TYPEFIND_MAX_BYTES};
use decodekit_core::{Caps, DecodeKitError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Decode bin configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DecodeBinConfig {
    /// Caps on which auto-plugging stops and the stream is exposed as-is.
    #[schemars(with = "String")]
    pub raw_caps: Caps,
    /// Forces the input caps and skips content-based type detection.
    #[schemars(with = "Option<String>")]
    pub sink_caps: Option<Caps>,
    /// Bytes the typefind stage buffers before giving up (default: 4096).
    pub typefind_max_bytes: usize,
    /// Post a missing-plugin notification for every dead branch (default: true).
    pub post_missing_plugins: bool,
}

impl Default for DecodeBinConfig {
    fn default() -> Self {
        Self {
            raw_caps: default_raw_caps(),
            sink_caps: None,
            typefind_max_bytes: DEFAULT_TYPEFIND_MAX_BYTES,
            post_missing_plugins: true,
        }
    }
}

fn default_raw_caps() -> Caps {
    DEFAULT_RAW_CAPS.parse().unwrap_or_else(|_| Caps::new_empty())
}

impl DecodeBinConfig {
    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `DecodeKitError::Configuration` if the document is malformed
    /// or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self, DecodeKitError> {
        let config: Self = serde_saphyr::from_str(yaml).map_err(|e| {
            DecodeKitError::Configuration(format!("Failed to parse decodebin config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses an optional JSON value, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns `DecodeKitError::Configuration` if the value is malformed or
    /// fails validation.
    pub fn from_json(params: Option<&serde_json::Value>) -> Result<Self, DecodeKitError> {
        let config: Self = match params {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                DecodeKitError::Configuration(format!("Failed to parse decodebin config: {e}"))
            })?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// JSON schema of the configuration.
    pub fn schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Self)).unwrap_or_default()
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `DecodeKitError::Configuration` describing the first violation.
    pub fn validate(&self) -> Result<(), DecodeKitError> {
        if self.typefind_max_bytes == 0 {
            return Err(DecodeKitError::Configuration(
                "typefind_max_bytes must be positive".to_string(),
            ));
        }
        if let Some(caps) = &self.sink_caps {
            if caps.is_empty() || caps.is_any() {
                return Err(DecodeKitError::Configuration(format!(
                    "sink_caps must describe a concrete format, got {caps}"
                )));
            }
        }
        Ok(())
    }
}
