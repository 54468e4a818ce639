// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end runs of the full pipeline: decoder threads, detection loop and consumer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use framekit_core::{Detection, FrameKitError, PixelFormat, Result, SlotMode};
use framekit_engine::{
    run_pipeline, MarkupSink, PipelineConfig, ResizeConverter, ResultEnvelope,
    SimulatedAccelerator, SyntheticProducer, TensorDesc,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const EDGE: u32 = 16;
const DEADLINE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Markup sink that remembers `(tag, sequence)` of every frame it was shown.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(u64, u64)>>>,
    finished: Arc<Mutex<bool>>,
}

impl Recorder {
    fn seen(&self) -> Vec<(u64, u64)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarkupSink for Recorder {
    async fn markup(
        &mut self,
        envelope: &ResultEnvelope,
        _image_id: i32,
        _detections: &[Detection],
    ) -> Result<()> {
        let (sequence, tag) = SyntheticProducer::read_header(envelope.frame().data())
            .ok_or_else(|| FrameKitError::Markup("frame without header".to_string()))?;
        assert_eq!(sequence, envelope.sequence);
        self.seen.lock().unwrap().push((tag, sequence));
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}

fn accelerator(concurrency: usize) -> Arc<SimulatedAccelerator> {
    Arc::new(
        SimulatedAccelerator::new(TensorDesc::bgr(EDGE, EDGE))
            .with_concurrency(concurrency)
            .with_latency(Duration::from_millis(2)),
    )
}

fn producers(streams: u64, frames: Option<u64>) -> Vec<SyntheticProducer> {
    (0..streams)
        .map(|tag| {
            let producer = SyntheticProducer::new(EDGE, EDGE, PixelFormat::Bgr24).with_tag(tag);
            match frames {
                Some(frames) => producer.with_frame_count(frames),
                None => producer.with_interval(Duration::from_millis(1)),
            }
        })
        .collect()
}

fn config(slot_mode: SlotMode) -> PipelineConfig {
    PipelineConfig {
        slot_mode,
        idle_backoff: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn every_frame_reaches_markup_in_submission_order() {
    init_tracing();
    let accelerator = accelerator(2);
    let sink = Recorder::default();

    let report = timeout(
        DEADLINE,
        run_pipeline(
            Arc::clone(&accelerator),
            ResizeConverter,
            producers(2, Some(10)),
            sink.clone(),
            config(SlotMode::Blocking),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();

    // Unscaled frames keep their header in the tensor, so the accelerator saw the same order.
    let submitted: Vec<(u64, u64)> = accelerator
        .submitted_headers()
        .iter()
        .map(|header| {
            let (sequence, tag) = SyntheticProducer::read_header(header).unwrap();
            (tag, sequence)
        })
        .collect();
    let seen = sink.seen();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen, submitted);
    for tag in 0..2 {
        let sequences: Vec<u64> =
            seen.iter().filter(|(t, _)| *t == tag).map(|(_, sequence)| *sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    }

    assert_eq!(report.scheduler.submitted, 20);
    assert_eq!(report.scheduler.delivered, 20);
    assert_eq!(report.scheduler.dropped_results, 0);
    assert_eq!(report.consumer.envelopes, 20);
    // One of the two simulated detections clears the default threshold.
    assert_eq!(report.consumer.detections_kept, 20);
    assert_eq!(report.producers.len(), 2);
    assert!(report.producers.iter().all(|p| p.produced == 10 && p.skipped == 0));
    assert!(*sink.finished.lock().unwrap());
    assert_eq!(accelerator.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_request_cap_serializes_two_streams() {
    init_tracing();
    let accelerator = accelerator(2);
    let sink = Recorder::default();

    let report = timeout(
        DEADLINE,
        run_pipeline(
            Arc::clone(&accelerator),
            ResizeConverter,
            producers(2, Some(10)),
            sink.clone(),
            PipelineConfig { max_in_flight: Some(1), ..config(SlotMode::Blocking) },
            CancellationToken::new(),
        ),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();

    let submitted: Vec<(u64, u64)> = accelerator
        .submitted_headers()
        .iter()
        .map(|header| {
            let (sequence, tag) = SyntheticProducer::read_header(header).unwrap();
            (tag, sequence)
        })
        .collect();
    let seen = sink.seen();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen, submitted);
    for tag in 0..2 {
        let sequences: Vec<u64> =
            seen.iter().filter(|(t, _)| *t == tag).map(|(_, sequence)| *sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    }

    assert_eq!(report.scheduler.delivered, 20);
    assert_eq!(report.scheduler.peak_in_flight, 1);
    assert_eq!(accelerator.peak_outstanding(), 1);
    assert_eq!(accelerator.outstanding(), 0);
    // The consumer saw the channel close.
    assert!(*sink.finished.lock().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn accelerator_load_stays_within_capacity_hint() {
    init_tracing();
    let accelerator = accelerator(2);

    let report = timeout(
        DEADLINE,
        run_pipeline(
            Arc::clone(&accelerator),
            ResizeConverter,
            producers(3, Some(20)),
            Recorder::default(),
            config(SlotMode::Blocking),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();

    assert_eq!(report.scheduler.submitted, 60);
    assert_eq!(report.consumer.envelopes, 60);
    assert!(report.scheduler.peak_in_flight <= 2);
    assert!(accelerator.peak_outstanding() <= 2);
    assert_eq!(report.scheduler.serviced_per_stream, vec![20, 20, 20]);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_blocking_decoders_drop_frames_instead_of_waiting() {
    init_tracing();
    let accelerator = accelerator(1);

    let report = timeout(
        DEADLINE,
        run_pipeline(
            accelerator,
            ResizeConverter,
            producers(1, Some(10)),
            Recorder::default(),
            config(SlotMode::NonBlocking),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("pipeline should finish")
    .unwrap();

    let decoder = &report.producers[0];
    assert_eq!(decoder.produced + decoder.skipped, 10);
    assert!(decoder.produced >= 1);
    // A frame published right before end of stream may never be picked up.
    assert!(report.scheduler.delivered <= decoder.produced);
    assert_eq!(report.scheduler.dropped_results, 0);
    assert_eq!(report.consumer.envelopes, report.scheduler.delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn accelerator_failure_stops_endless_streams() {
    init_tracing();
    for mode in [SlotMode::Blocking, SlotMode::NonBlocking] {
        let outcome = timeout(
            DEADLINE,
            run_pipeline(
                Arc::new(
                    SimulatedAccelerator::new(TensorDesc::bgr(EDGE, EDGE))
                        .with_concurrency(2)
                        .with_latency(Duration::from_millis(1))
                        .with_failure_on_wait(3),
                ),
                ResizeConverter,
                producers(2, None),
                Recorder::default(),
                config(mode),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("pipeline should stop after the failure");

        let err = outcome.expect_err("accelerator failure must be reported");
        assert!(err.is_fatal(), "{mode:?}: {err}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_tears_everything_down() {
    init_tracing();
    let cancel = CancellationToken::new();
    let pipeline = tokio::spawn(run_pipeline(
        accelerator(2),
        ResizeConverter,
        producers(2, None),
        Recorder::default(),
        config(SlotMode::Blocking),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = timeout(DEADLINE, pipeline)
        .await
        .expect("pipeline should stop after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(report.producers.len(), 2);
    assert_eq!(report.consumer.envelopes, report.scheduler.delivered);
    assert_eq!(report.scheduler.submitted, report.scheduler.delivered);
}

#[tokio::test]
async fn refuses_to_run_without_streams() {
    let outcome = run_pipeline(
        accelerator(2),
        ResizeConverter,
        Vec::<SyntheticProducer>::new(),
        Recorder::default(),
        PipelineConfig::default(),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(outcome, Err(FrameKitError::Configuration(_))));
}

#[tokio::test]
async fn rejects_invalid_threshold() {
    let config = PipelineConfig { confidence_threshold: -0.1, ..PipelineConfig::default() };
    let outcome = run_pipeline(
        accelerator(2),
        ResizeConverter,
        producers(1, Some(1)),
        Recorder::default(),
        config,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(outcome, Err(FrameKitError::Configuration(_))));
}
