// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Result consumer: filters detections and hands them to the markup collaborator.
//!
//! The consumer runs as a cooperative task so slow or failing markup never stalls the
//! scheduler thread. Every envelope is released back to its stream slot once it has been
//! handled, whether markup succeeded or not.

use async_trait::async_trait;
use framekit_core::{ConsumerStats, Detection, Result};
use indexmap::IndexMap;

use crate::constants::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::result_channel::{ResultEnvelope, ResultReceiver};

/// Downstream markup/export collaborator.
#[async_trait]
pub trait MarkupSink: Send {
    /// Handle the detections of one detection target in `envelope`'s frame.
    ///
    /// `detections` is non-empty and already filtered by confidence.
    ///
    /// # Errors
    ///
    /// Any error is logged and counted; it never reaches the scheduler.
    async fn markup(
        &mut self,
        envelope: &ResultEnvelope,
        image_id: i32,
        detections: &[Detection],
    ) -> Result<()>;

    /// Called once after the last envelope.
    ///
    /// # Errors
    ///
    /// Logged by the consumer.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads the result channel until it closes.
pub struct ResultConsumer<S> {
    results: ResultReceiver,
    sink: S,
    threshold: f32,
    stats: ConsumerStats,
}

impl<S: MarkupSink> ResultConsumer<S> {
    pub fn new(results: ResultReceiver, sink: S) -> Self {
        Self {
            results,
            sink,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            stats: ConsumerStats::default(),
        }
    }

    /// Detections must score strictly above `threshold` to be passed on.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn run(mut self) -> ConsumerStats {
        tracing::debug!(threshold = self.threshold, "Result consumer started");

        while let Some(envelope) = self.results.recv().await {
            self.handle(&envelope).await;
            // Dropping the envelope returns the frame to its producer.
            drop(envelope);
        }

        if let Err(e) = self.sink.finish().await {
            tracing::warn!(error = %e, "Markup sink failed to finish");
        }
        tracing::debug!(
            envelopes = self.stats.envelopes,
            detections_kept = self.stats.detections_kept,
            markup_failures = self.stats.markup_failures,
            "Result consumer finished"
        );
        self.stats
    }

    async fn handle(&mut self, envelope: &ResultEnvelope) {
        self.stats.envelopes += 1;

        let mut groups: IndexMap<i32, Vec<Detection>> = IndexMap::new();
        for detection in envelope.detections.iter().filter(|d| d.confidence > self.threshold) {
            groups.entry(detection.image_id).or_default().push(*detection);
        }

        for (image_id, detections) in &groups {
            self.stats.detections_kept += detections.len() as u64;
            if let Err(e) = self.sink.markup(envelope, *image_id, detections).await {
                self.stats.markup_failures += 1;
                tracing::warn!(
                    stream_id = envelope.stream_id,
                    sequence = envelope.sequence,
                    image_id,
                    error = %e,
                    "Markup failed"
                );
            }
        }
        tracing::trace!(
            stream_id = envelope.stream_id,
            sequence = envelope.sequence,
            groups = groups.len(),
            "Envelope handled"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::result_channel::result_channel;
    use framekit_core::{BoundingBox, FrameKitError, SlotMode, SlotState, StreamSlot};
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(usize, i32, Vec<i32>)>>>,
        fail: bool,
    }

    #[async_trait]
    impl MarkupSink for Recorder {
        async fn markup(
            &mut self,
            envelope: &ResultEnvelope,
            image_id: i32,
            detections: &[Detection],
        ) -> Result<()> {
            let classes = detections.iter().map(|d| d.class_id).collect();
            self.calls.lock().unwrap().push((envelope.stream_id, image_id, classes));
            if self.fail {
                return Err(FrameKitError::Markup("disk full".to_string()));
            }
            Ok(())
        }
    }

    fn detection(image_id: i32, class_id: i32, confidence: f32) -> Detection {
        Detection { image_id, class_id, confidence, bbox: BoundingBox::new(0.0, 0.0, 0.5, 0.5) }
    }

    fn envelope(slot: &Arc<StreamSlot>, detections: Vec<Detection>) -> ResultEnvelope {
        let id = slot.id();
        let frame = slot.try_acquire_for_produce(id).unwrap();
        slot.mark_produced(id, frame);
        ResultEnvelope::new(slot.try_consume(id).unwrap(), detections)
    }

    #[tokio::test]
    async fn filters_strictly_and_groups_by_image() {
        let slot = Arc::new(StreamSlot::new(0, SlotMode::NonBlocking));
        let (tx, rx) = result_channel(1);
        let sink = Recorder::default();

        tx.send(envelope(
            &slot,
            vec![
                detection(1, 10, 0.9),
                detection(0, 11, 0.6),
                detection(0, 12, 0.61),
                detection(1, 13, 0.7),
                detection(2, 14, 0.1),
            ],
        ));
        tx.close();

        let stats = ResultConsumer::new(rx, sink.clone()).run().await;
        assert_eq!(stats.envelopes, 1);
        assert_eq!(stats.detections_kept, 3);
        assert_eq!(stats.markup_failures, 0);
        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![(0, 1, vec![10, 13]), (0, 0, vec![12])],
        );
        assert_eq!(slot.state(), SlotState::Idle);
    }

    #[tokio::test]
    async fn markup_failure_still_releases_frame() {
        let slot = Arc::new(StreamSlot::new(3, SlotMode::NonBlocking));
        let (tx, rx) = result_channel(1);
        let sink = Recorder { fail: true, ..Recorder::default() };

        tx.send(envelope(&slot, vec![detection(0, 1, 0.95)]));
        tx.close();

        let stats = ResultConsumer::new(rx, sink).with_threshold(0.5).run().await;
        assert_eq!(stats.markup_failures, 1);
        assert_eq!(slot.state(), SlotState::Idle);
    }

    #[tokio::test]
    async fn envelope_without_confident_detections_skips_markup() {
        let slot = Arc::new(StreamSlot::new(0, SlotMode::NonBlocking));
        let (tx, rx) = result_channel(1);
        let sink = Recorder::default();

        tx.send(envelope(&slot, vec![detection(0, 1, 0.2)]));
        tx.close();

        let stats = ResultConsumer::new(rx, sink.clone()).run().await;
        assert_eq!(stats.envelopes, 1);
        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(slot.state(), SlotState::Idle);
    }
}
