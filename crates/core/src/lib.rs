// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FrameKit Core - shared data structures for multi-stream detection pipelines.
//!
//! ## Core Modules
//!
//! - [`types`]: Frames, pixel formats and detections
//! - [`slot`]: Per-stream single-frame handoff between a decoder and the scheduler
//! - [`buffer_pool`]: Bounded pool of reusable buffers with exclusive ownership
//! - [`stats`]: Counters reported by each pipeline stage
//! - [`error`]: Error types and handling

pub mod buffer_pool;
pub mod error;
pub mod slot;
pub mod stats;
pub mod types;

pub use buffer_pool::{BufferPool, PoolOwner, PoolStats, PooledSender};
pub use error::{FrameKitError, Result};
pub use slot::{FrameLease, SlotMode, SlotState, StreamSlot};
pub use stats::{ConsumerStats, ProducerStats, SchedulerStats};
pub use types::{BoundingBox, Detection, Frame, PixelFormat, StreamId};
