// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Counters collected by the pipeline stages.
//!
//! Each stage owns its counters and hands out a snapshot when it stops. The
//! snapshots are plain serializable structs so the CLI can log or dump them.

use serde::{Deserialize, Serialize};

/// Counters kept by the detection scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Full passes over the stream slots
    pub scans: u64,
    /// Requests handed to the accelerator
    pub submitted: u64,
    /// Result envelopes accepted by the result channel
    pub delivered: u64,
    /// Result envelopes dropped because the result channel was full or closed
    pub dropped_results: u64,
    /// Frames skipped because the conversion step failed
    pub conversion_errors: u64,
    /// Requests whose accelerator output could not be decoded
    pub decode_errors: u64,
    /// Times the scheduler backed off because no stream had a frame
    pub idle_sleeps: u64,
    /// Highest number of requests ever in flight at once
    pub peak_in_flight: usize,
    /// Submissions per stream, indexed by stream id
    pub serviced_per_stream: Vec<u64>,
}

impl SchedulerStats {
    pub fn for_streams(streams: usize) -> Self {
        Self { serviced_per_stream: vec![0; streams], ..Self::default() }
    }

    #[inline]
    pub fn submitted_for(&mut self, stream_id: usize, in_flight: usize) {
        self.submitted += 1;
        if let Some(count) = self.serviced_per_stream.get_mut(stream_id) {
            *count += 1;
        }
        self.peak_in_flight = self.peak_in_flight.max(in_flight);
    }

    #[inline]
    pub const fn delivered(&mut self) {
        self.delivered += 1;
    }

    #[inline]
    pub const fn dropped(&mut self) {
        self.dropped_results += 1;
    }
}

/// Counters kept by the result consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub envelopes: u64,
    /// Detections above the confidence threshold that were passed to the sink
    pub detections_kept: u64,
    pub markup_failures: u64,
}

/// Counters kept by one decoder thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStats {
    /// Frames published into the stream slot
    pub produced: u64,
    /// Frames decoded and discarded because the slot was busy
    pub skipped: u64,
}

impl ProducerStats {
    #[inline]
    pub const fn produced(&mut self) {
        self.produced += 1;
    }

    #[inline]
    pub const fn skipped(&mut self) {
        self.skipped += 1;
    }
}
