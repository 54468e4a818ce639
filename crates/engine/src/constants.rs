// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Default values for the detection pipeline.
//!
//! The CLI configuration and [`PipelineConfig`](crate::PipelineConfig) both reference these
//! so the library and the binary agree on what "default" means.

use std::time::Duration;

// === Result Filtering ===

/// Minimum confidence a detection must exceed to reach the markup sink.
///
/// The comparison is strict: a detection scoring exactly the threshold is dropped.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

// === Scheduler Pacing ===

/// How long the scheduler sleeps after a scan that found no ready frame and had
/// nothing in flight to drain.
///
/// Lower values react faster to new frames at the cost of more wakeups.
/// Recommended range: 1-100 ms.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Minimum interval between two scheduler stats log lines.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

// === Accelerator Output ===

/// Values per proposal row in SSD-style detection output:
/// `[image_id, label, confidence, x_min, y_min, x_max, y_max]`.
pub const SSD_ROW_SIZE: usize = 7;

// === Simulated Accelerator ===

/// Capacity hint reported by the simulated accelerator unless configured otherwise.
pub const DEFAULT_SIMULATED_CONCURRENCY: usize = 4;

/// Per-request latency of the simulated accelerator.
pub const DEFAULT_SIMULATED_LATENCY: Duration = Duration::from_millis(15);

/// Input tensor edge length used by the simulated accelerator (square, 3 channels).
pub const DEFAULT_SIMULATED_INPUT_SIZE: u32 = 300;
