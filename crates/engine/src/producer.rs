// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Decoder side of a stream: fills the slot's frame and publishes it.

use std::time::Duration;

use framekit_core::{Frame, PixelFormat, ProducerStats, Result, SlotMode, StreamId, StreamSlot};
use tokio_util::sync::CancellationToken;

/// Result of asking a producer for its next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceOutcome {
    Produced,
    EndOfStream,
}

/// A frame source driven by [`run_producer`] on its own thread.
pub trait FrameProducer: Send {
    /// Decode the next frame into `frame`, resizing it as needed.
    ///
    /// # Errors
    ///
    /// An error ends the stream.
    fn produce(&mut self, frame: &mut Frame) -> Result<ProduceOutcome>;

    /// Decode and discard the next frame because the slot is busy.
    ///
    /// # Errors
    ///
    /// An error ends the stream.
    fn skip(&mut self) -> Result<ProduceOutcome>;
}

/// Per-stream decoder loop.
///
/// Runs until the producer reports end of stream or fails, the slot is finished by someone
/// else, or `cancel` fires. The slot is always marked finished on return.
pub fn run_producer<P: FrameProducer + ?Sized>(
    id: StreamId,
    slot: &StreamSlot,
    producer: &mut P,
    cancel: &CancellationToken,
) -> ProducerStats {
    let mut stats = ProducerStats::default();
    tracing::debug!(stream_id = id, mode = ?slot.mode(), "Decoder started");

    while !cancel.is_cancelled() && !slot.is_finished() {
        let outcome = if let Some(mut frame) = slot.try_acquire_for_produce(id) {
            match producer.produce(&mut frame) {
                Ok(ProduceOutcome::Produced) => {
                    let sequence = frame.sequence();
                    stats.produced();
                    if !slot.mark_produced(id, frame) {
                        tracing::debug!(stream_id = id, sequence, "Slot finished during handoff");
                        break;
                    }
                    Ok(ProduceOutcome::Produced)
                },
                other => {
                    slot.abort_produce(id, frame);
                    other
                },
            }
        } else if slot.mode() == SlotMode::NonBlocking {
            // Consumer still has the previous frame: decode this one and drop it.
            let outcome = producer.skip();
            if matches!(outcome, Ok(ProduceOutcome::Produced)) {
                stats.skipped();
            }
            outcome
        } else {
            std::thread::yield_now();
            Ok(ProduceOutcome::Produced)
        };

        match outcome {
            Ok(ProduceOutcome::Produced) => {},
            Ok(ProduceOutcome::EndOfStream) => {
                tracing::debug!(stream_id = id, "End of stream");
                break;
            },
            Err(e) => {
                tracing::warn!(stream_id = id, error = %e, "Decoder failed, ending stream");
                break;
            },
        }
    }

    slot.mark_finished(id);
    tracing::debug!(
        stream_id = id,
        produced = stats.produced,
        skipped = stats.skipped,
        "Decoder stopped"
    );
    stats
}

/// Deterministic frame source for demos and tests.
///
/// Every frame starts with a 16 byte header: the frame sequence number and the stream tag,
/// both little-endian `u64`. The rest of the frame is a flat gray level derived from the
/// sequence number.
#[derive(Debug, Clone)]
pub struct SyntheticProducer {
    width: u32,
    height: u32,
    format: PixelFormat,
    tag: u64,
    limit: Option<u64>,
    interval: Option<Duration>,
    next: u64,
}

impl SyntheticProducer {
    /// Size of the header written at the start of every frame.
    pub const HEADER_LEN: usize = 16;

    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self { width, height, format, tag: 0, limit: None, interval: None, next: 0 }
    }

    /// Stop after `frames` frames (produced or skipped). Unlimited by default.
    #[must_use]
    pub const fn with_frame_count(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Spend `interval` decoding each frame.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Value written into the tag half of every header, usually the stream id.
    #[must_use]
    pub const fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Read `(sequence, tag)` back from the start of a frame or an unscaled tensor.
    pub fn read_header(bytes: &[u8]) -> Option<(u64, u64)> {
        let sequence = bytes.get(..8)?.try_into().ok().map(u64::from_le_bytes)?;
        let tag = bytes.get(8..16)?.try_into().ok().map(u64::from_le_bytes)?;
        Some((sequence, tag))
    }

    fn advance(&mut self) -> Option<u64> {
        if self.limit.is_some_and(|limit| self.next >= limit) {
            return None;
        }
        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }
        let sequence = self.next;
        self.next += 1;
        Some(sequence)
    }
}

impl FrameProducer for SyntheticProducer {
    fn produce(&mut self, frame: &mut Frame) -> Result<ProduceOutcome> {
        let Some(sequence) = self.advance() else {
            return Ok(ProduceOutcome::EndOfStream);
        };

        frame.resize(self.width, self.height, self.format);
        frame.set_sequence(sequence);
        let data = frame.data_mut();
        data.fill(u8::try_from(sequence % 251).unwrap_or_default());
        let mut header = [0u8; Self::HEADER_LEN];
        header[..8].copy_from_slice(&sequence.to_le_bytes());
        header[8..].copy_from_slice(&self.tag.to_le_bytes());
        let len = data.len().min(Self::HEADER_LEN);
        data[..len].copy_from_slice(&header[..len]);
        Ok(ProduceOutcome::Produced)
    }

    fn skip(&mut self) -> Result<ProduceOutcome> {
        Ok(self.advance().map_or(ProduceOutcome::EndOfStream, |_| ProduceOutcome::Produced))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use framekit_core::{FrameKitError, SlotState};
    use std::sync::Arc;

    #[test]
    fn synthetic_frames_carry_header() {
        let slot = StreamSlot::new(0, SlotMode::NonBlocking);
        let mut producer = SyntheticProducer::new(4, 4, PixelFormat::Bgr24).with_tag(7);
        let mut frame = slot.try_acquire_for_produce(0).unwrap();

        assert_eq!(producer.produce(&mut frame).unwrap(), ProduceOutcome::Produced);
        assert_eq!(producer.produce(&mut frame).unwrap(), ProduceOutcome::Produced);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.data().len(), 48);
        assert_eq!(SyntheticProducer::read_header(frame.data()), Some((1, 7)));
        assert_eq!(frame.data()[47], 1);
        slot.abort_produce(0, frame);
    }

    #[test]
    fn frame_count_limits_produce_and_skip() {
        let mut producer = SyntheticProducer::new(1, 1, PixelFormat::Gray8).with_frame_count(2);
        assert_eq!(producer.skip().unwrap(), ProduceOutcome::Produced);
        assert_eq!(producer.skip().unwrap(), ProduceOutcome::Produced);
        assert_eq!(producer.skip().unwrap(), ProduceOutcome::EndOfStream);
    }

    #[test]
    fn run_producer_finishes_slot_at_end_of_stream() {
        let slot = Arc::new(StreamSlot::new(0, SlotMode::Blocking));
        let consumer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                let mut sequences = Vec::new();
                while !slot.is_finished() {
                    if let Some(lease) = slot.try_consume(0) {
                        sequences.push(lease.sequence());
                    } else {
                        std::thread::yield_now();
                    }
                }
                sequences
            })
        };

        let mut producer = SyntheticProducer::new(2, 2, PixelFormat::Gray8).with_frame_count(5);
        let stats = run_producer(0, &slot, &mut producer, &CancellationToken::new());

        assert_eq!(stats.produced, 5);
        assert_eq!(stats.skipped, 0);
        assert!(slot.is_finished());
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn non_blocking_contention_skips_frames() {
        let slot = StreamSlot::new(0, SlotMode::NonBlocking);
        let mut producer = SyntheticProducer::new(1, 1, PixelFormat::Gray8).with_frame_count(4);

        // Nobody consumes: the first frame is published, the other three are skipped.
        // Running into end of stream while the slot is busy loses nothing.
        let stats = run_producer(0, &slot, &mut producer, &CancellationToken::new());
        assert_eq!(stats.produced, 1);
        assert_eq!(stats.skipped, 3);
        assert_eq!(slot.state(), SlotState::Finished);
    }

    #[test]
    fn cancelled_producer_still_finishes_slot() {
        let slot = StreamSlot::new(0, SlotMode::Blocking);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut producer = SyntheticProducer::new(1, 1, PixelFormat::Gray8);
        let stats = run_producer(0, &slot, &mut producer, &cancel);
        assert_eq!(stats.produced, 0);
        assert!(slot.is_finished());
    }

    struct Failing;

    impl FrameProducer for Failing {
        fn produce(&mut self, _frame: &mut Frame) -> Result<ProduceOutcome> {
            Err(FrameKitError::Runtime("corrupt bitstream".to_string()))
        }

        fn skip(&mut self) -> Result<ProduceOutcome> {
            Ok(ProduceOutcome::Produced)
        }
    }

    #[test]
    fn decoder_error_returns_frame_and_finishes() {
        let slot = StreamSlot::new(0, SlotMode::Blocking);
        let stats = run_producer(0, &slot, &mut Failing, &CancellationToken::new());
        assert_eq!(stats.produced, 0);
        assert!(slot.is_finished());
    }
}
