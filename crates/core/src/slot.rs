// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Single-slot frame rendezvous between one decoder thread and the scheduler.
//!
//! Each stream owns exactly one long-lived [`Frame`]. The slot state machine decides who
//! may touch it:
//!
//! ```text
//!            try_acquire_for_produce           mark_produced
//!     Idle ─────────────────────────► Producing ─────────────► Produced
//!      ▲  ◄───────────────────────────────┘ abort_produce          │
//!      │                                                           │ try_acquire_for_consume
//!      │              mark_consumed                                ▼
//!      └───────────────────────────────────────────────────── Consuming
//!
//!     any state ── mark_finished ──► Finished (terminal)
//! ```
//!
//! Transitions are single compare-and-swap operations on an atomic state byte. In
//! [`SlotMode::Blocking`] the producer additionally parks in `mark_produced` until the
//! consumer has returned the frame, so decoding never runs ahead of detection. In
//! [`SlotMode::NonBlocking`] the producer returns immediately and simply fails to acquire
//! the frame while the consumer still holds it, dropping that input frame.
//!
//! The parked frame sits in a `Mutex<Option<Frame>>` in both modes. Only the side the state
//! machine currently grants the frame ever locks it, so the mutex is never contended. The
//! only blocking primitives in play are the blocking-mode handoff condvar and the pool lock.
//!
//! Calls with the wrong stream id, a frame belonging to another slot, or from a state the
//! caller cannot legally be in are programming errors and panic.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::{Frame, StreamId};

static NEXT_SLOT_KEY: AtomicU64 = AtomicU64::new(1);

/// Observable state of a [`StreamSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Frame is parked in the slot, available to the producer.
    Idle = 0,
    /// Producer holds the frame and is filling it.
    Producing = 1,
    /// Frame is parked in the slot, filled and waiting for the consumer.
    Produced = 2,
    /// Consumer holds the frame.
    Consuming = 3,
    /// No further frames will ever arrive.
    Finished = 4,
}

impl SlotState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Producing,
            2 => Self::Produced,
            3 => Self::Consuming,
            _ => Self::Finished,
        }
    }
}

/// How a producer behaves after publishing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
    /// `mark_produced` waits until the consumer has returned the frame.
    #[default]
    Blocking,
    /// `mark_produced` returns immediately; frames arriving while the consumer is busy are lost.
    NonBlocking,
}

struct Handoff {
    consumed: Mutex<u64>,
    signal: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-stream single-slot rendezvous.
pub struct StreamSlot {
    id: StreamId,
    key: u64,
    mode: SlotMode,
    state: AtomicU8,
    /// Only locked by the side that owns the frame in the current state.
    frame: Mutex<Option<Frame>>,
    handoff: Option<Handoff>,
}

impl StreamSlot {
    pub fn new(id: StreamId, mode: SlotMode) -> Self {
        let key = NEXT_SLOT_KEY.fetch_add(1, Ordering::Relaxed);
        let handoff = match mode {
            SlotMode::Blocking => {
                Some(Handoff { consumed: Mutex::new(0), signal: Condvar::new() })
            },
            SlotMode::NonBlocking => None,
        };
        Self {
            id,
            key,
            mode,
            state: AtomicU8::new(SlotState::Idle as u8),
            frame: Mutex::new(Some(Frame::empty(key))),
            handoff,
        }
    }

    pub const fn id(&self) -> StreamId {
        self.id
    }

    pub const fn mode(&self) -> SlotMode {
        self.mode
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SlotState::Finished
    }

    /// Take the frame for filling. Returns `None` while the consumer holds it (normal
    /// contention) or once the slot is finished.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not this slot's stream id.
    pub fn try_acquire_for_produce(&self, id: StreamId) -> Option<Frame> {
        self.verify_id(id);
        if self.transition(SlotState::Idle, SlotState::Producing) {
            Some(self.take_frame())
        } else {
            None
        }
    }

    /// Publish a filled frame to the consumer.
    ///
    /// In blocking mode this parks the calling thread until the consumer calls
    /// [`mark_consumed`](Self::mark_consumed). Returns `false` when the slot was finished
    /// before the handoff completed.
    ///
    /// # Panics
    ///
    /// Panics on a foreign id or frame, or if the producer did not hold the frame.
    pub fn mark_produced(&self, id: StreamId, frame: Frame) -> bool {
        self.verify(id, &frame);
        self.put_frame(frame);

        let Some(handoff) = &self.handoff else {
            return self.publish();
        };

        // Snapshot the consumed generation before publishing so a fast consumer can't be missed.
        let guard = lock(&handoff.consumed);
        let generation = *guard;
        if !self.publish() {
            return false;
        }
        let guard = handoff
            .signal
            .wait_while(guard, |consumed| *consumed == generation && !self.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        *guard != generation
    }

    /// Give an acquired frame back without publishing it (end of stream, decode failure).
    ///
    /// # Panics
    ///
    /// Panics on a foreign id or frame, or if the producer did not hold the frame.
    pub fn abort_produce(&self, id: StreamId, frame: Frame) {
        self.verify(id, &frame);
        self.put_frame(frame);
        if !self.transition(SlotState::Producing, SlotState::Idle) {
            self.expect_finished("abort_produce");
        }
    }

    /// Take a published frame. Returns `None` when nothing new is ready.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not this slot's stream id.
    pub fn try_acquire_for_consume(&self, id: StreamId) -> Option<Frame> {
        self.verify_id(id);
        if self.transition(SlotState::Produced, SlotState::Consuming) {
            Some(self.take_frame())
        } else {
            None
        }
    }

    /// Like [`try_acquire_for_consume`](Self::try_acquire_for_consume), but wraps the frame in
    /// a [`FrameLease`] that returns it to this slot when dropped.
    pub fn try_consume(self: &Arc<Self>, id: StreamId) -> Option<FrameLease> {
        self.try_acquire_for_consume(id)
            .map(|frame| FrameLease { slot: Arc::clone(self), frame: Some(frame) })
    }

    /// Return a consumed frame to the producer, waking it in blocking mode.
    ///
    /// Returning a frame to a slot that finished meanwhile is allowed; the slot stays finished.
    ///
    /// # Panics
    ///
    /// Panics on a foreign id or frame, or if the consumer did not hold the frame.
    pub fn mark_consumed(&self, id: StreamId, frame: Frame) {
        self.verify(id, &frame);
        self.put_frame(frame);
        if !self.transition(SlotState::Consuming, SlotState::Idle) {
            self.expect_finished("mark_consumed");
        }
        if let Some(handoff) = &self.handoff {
            let mut consumed = lock(&handoff.consumed);
            *consumed = consumed.wrapping_add(1);
            handoff.signal.notify_all();
        }
    }

    /// Mark the stream as exhausted. Idempotent; wakes a producer parked in `mark_produced`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not this slot's stream id.
    pub fn mark_finished(&self, id: StreamId) {
        self.verify_id(id);
        let previous =
            SlotState::from_u8(self.state.swap(SlotState::Finished as u8, Ordering::AcqRel));
        if previous != SlotState::Finished {
            tracing::debug!(stream_id = self.id, ?previous, "Stream slot finished");
        }
        if let Some(handoff) = &self.handoff {
            let _consumed = lock(&handoff.consumed);
            handoff.signal.notify_all();
        }
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self) -> bool {
        if self.transition(SlotState::Producing, SlotState::Produced) {
            tracing::trace!(stream_id = self.id, "Frame produced");
            true
        } else {
            self.expect_finished("mark_produced");
            false
        }
    }

    fn expect_finished(&self, operation: &str) {
        let state = self.state();
        assert!(
            state == SlotState::Finished,
            "stream {}: {operation} called while slot is {state:?}",
            self.id
        );
    }

    fn take_frame(&self) -> Frame {
        let Some(frame) = lock(&self.frame).take() else {
            panic!("stream {}: slot state says the frame is parked but it is missing", self.id);
        };
        frame
    }

    fn put_frame(&self, frame: Frame) {
        let previous = lock(&self.frame).replace(frame);
        assert!(previous.is_none(), "stream {}: a second frame was parked in the slot", self.id);
    }

    fn verify_id(&self, id: StreamId) {
        assert!(id == self.id, "stream slot {} called with stream id {id}", self.id);
    }

    fn verify(&self, id: StreamId, frame: &Frame) {
        self.verify_id(id);
        assert!(
            frame.origin() == self.key,
            "stream slot {} was handed a frame that belongs to another slot",
            self.id
        );
    }
}

impl std::fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSlot")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Consumer-side ownership of a slot's frame.
///
/// Dropping the lease calls [`StreamSlot::mark_consumed`], so the producer gets its frame
/// back on every exit path, including errors and panics in downstream processing.
pub struct FrameLease {
    slot: Arc<StreamSlot>,
    frame: Option<Frame>,
}

impl FrameLease {
    pub fn stream_id(&self) -> StreamId {
        self.slot.id()
    }

    pub fn frame(&self) -> &Frame {
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease is only emptied on drop"),
        }
    }

    /// Return the frame to its producer now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        self.frame()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.slot.mark_consumed(self.slot.id(), frame);
        }
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease")
            .field("stream_id", &self.slot.id())
            .field("frame", &self.frame)
            .finish()
    }
}
