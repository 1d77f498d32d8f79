// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry counters for chain construction.
//!
//! Recorded through the global meter provider; a no-op unless the embedder
//! installs one.

use crate::constants::METER_NAME;
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};

pub(crate) struct BinMetrics {
    chains_created: Counter<u64>,
    candidates_tried: Counter<u64>,
    candidates_rejected: Counter<u64>,
    pads_exposed: Counter<u64>,
    chains_dead: Counter<u64>,
}

impl BinMetrics {
    pub fn new() -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            chains_created: meter
                .u64_counter("decodebin.chains.created")
                .with_description("Processing chains created (root and demuxer children)")
                .build(),
            candidates_tried: meter
                .u64_counter("decodebin.candidates.tried")
                .with_description("Candidate factories the attachment loop tried")
                .build(),
            candidates_rejected: meter
                .u64_counter("decodebin.candidates.rejected")
                .with_description("Candidates rejected or rolled back")
                .build(),
            pads_exposed: meter
                .u64_counter("decodebin.pads.exposed")
                .with_description("Source pads published by the bin")
                .build(),
            chains_dead: meter
                .u64_counter("decodebin.chains.dead")
                .with_description("Chains that ended without a usable candidate")
                .build(),
        }
    }

    pub fn chain_created(&self) {
        self.chains_created.add(1, &[]);
    }

    pub fn candidate_tried(&self, factory: &str) {
        self.candidates_tried.add(1, &[KeyValue::new("factory", factory.to_string())]);
    }

    pub fn candidate_rejected(&self, factory: &str, reason: &'static str) {
        self.candidates_rejected.add(
            1,
            &[KeyValue::new("factory", factory.to_string()), KeyValue::new("reason", reason)],
        );
    }

    pub fn pads_exposed(&self, count: u64) {
        self.pads_exposed.add(count, &[]);
    }

    pub fn chain_dead(&self, media_type: &str) {
        self.chains_dead.add(1, &[KeyValue::new("media_type", media_type.to_string())]);
    }
}
