// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Scheduler-owned bookkeeping for each stream.

use std::sync::Arc;
use std::time::Instant;

use framekit_core::{BufferPool, FrameLease, StreamId, StreamSlot};

use crate::accelerator::TensorBuffer;

/// Conversion context of one stream, created the first time the stream has a frame.
///
/// The conversion buffer is owned here while idle and by the accelerator request while a
/// frame is in flight. Dropping the state returns the buffer to the scheduler's pool.
pub struct PerStreamState {
    index: StreamId,
    slot: Arc<StreamSlot>,
    buffer: Option<TensorBuffer>,
    in_flight: bool,
}

impl PerStreamState {
    pub(crate) const fn new(index: StreamId, slot: Arc<StreamSlot>) -> Self {
        Self { index, slot, buffer: None, in_flight: false }
    }

    pub const fn index(&self) -> StreamId {
        self.index
    }

    pub fn slot(&self) -> &Arc<StreamSlot> {
        &self.slot
    }

    pub const fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Take the conversion buffer, allocating it from `pool` on first use.
    ///
    /// Returns `None` only if the pool is exhausted.
    pub(crate) fn take_buffer(&mut self, pool: &BufferPool<Vec<u8>>) -> Option<TensorBuffer> {
        self.buffer.take().or_else(|| {
            let buffer = pool.try_acquire();
            if buffer.is_some() {
                tracing::debug!(stream_id = self.index, "Allocated conversion buffer");
            }
            buffer
        })
    }

    pub(crate) fn put_buffer(&mut self, buffer: TensorBuffer) {
        self.buffer = Some(buffer);
    }

    pub(crate) const fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }
}

impl Drop for PerStreamState {
    fn drop(&mut self) {
        if self.buffer.take().is_some() {
            tracing::trace!(stream_id = self.index, "Released conversion buffer");
        }
    }
}

/// One request submitted to the accelerator and not yet completed.
///
/// Holds the frame lease, so the stream's frame stays with the scheduler until the result
/// is handed on or the request is abandoned.
pub(crate) struct InFlightRequest<R> {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub lease: FrameLease,
    pub request: R,
    pub submitted_at: Instant,
}
