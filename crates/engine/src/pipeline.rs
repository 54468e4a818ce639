// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wires decoders, the detection loop and the result consumer together.
//!
//! Threading model:
//! - one named OS thread per stream running [`run_producer`]
//! - the detection loop on a blocking task (it parks on accelerator waits)
//! - the result consumer as a regular async task

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use framekit_core::{
    ConsumerStats, FrameKitError, ProducerStats, Result, SchedulerStats, SlotMode, StreamSlot,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::accelerator::InferenceAccelerator;
use crate::constants::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IDLE_BACKOFF, DEFAULT_STATS_INTERVAL};
use crate::consumer::{MarkupSink, ResultConsumer};
use crate::converter::FrameConverter;
use crate::producer::{run_producer, FrameProducer};
use crate::result_channel::result_channel;
use crate::scheduler::{DetectionScheduler, SchedulerConfig};

/// Settings for [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub slot_mode: SlotMode,
    /// Detections must score strictly above this to reach the markup sink.
    pub confidence_threshold: f32,
    pub idle_backoff: Duration,
    /// Overrides the accelerator's capacity hint.
    pub max_in_flight: Option<usize>,
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slot_mode: SlotMode::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_in_flight: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl PipelineConfig {
    /// # Errors
    ///
    /// Returns `FrameKitError::Configuration` for a threshold outside `[0, 1]` or a zero
    /// idle backoff.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(FrameKitError::Configuration(format!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.idle_backoff.is_zero() {
            return Err(FrameKitError::Configuration(
                "idle backoff must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            idle_backoff: self.idle_backoff,
            max_in_flight: self.max_in_flight,
            stats_interval: self.stats_interval,
        }
    }
}

/// Counters collected from every stage of a finished pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub scheduler: SchedulerStats,
    pub consumer: ConsumerStats,
    /// Indexed by stream id
    pub producers: Vec<ProducerStats>,
}

/// Run one stream per producer against `accelerator` until every stream ends, `cancel`
/// fires, or the accelerator fails.
///
/// Teardown always runs to completion before this returns: every slot is finished (waking
/// decoders parked on a handoff), all decoder threads are joined and the consumer has
/// drained the result channel.
///
/// # Errors
///
/// Returns `FrameKitError::Configuration` for invalid settings or an empty producer list,
/// `FrameKitError::Io` if a decoder thread can't be spawned, and the detection loop's
/// accelerator error if it failed.
pub async fn run_pipeline<A, C, P, S>(
    accelerator: Arc<A>,
    converter: C,
    producers: Vec<P>,
    sink: S,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> Result<PipelineReport>
where
    A: InferenceAccelerator + 'static,
    A::Request: 'static,
    C: FrameConverter + 'static,
    P: FrameProducer + 'static,
    S: MarkupSink + 'static,
{
    config.validate()?;
    let streams = producers.len();
    let slots: Vec<Arc<StreamSlot>> =
        (0..streams).map(|id| Arc::new(StreamSlot::new(id, config.slot_mode))).collect();

    let (results_tx, results_rx) = result_channel(streams);
    let scheduler = DetectionScheduler::new(
        accelerator,
        converter,
        slots.clone(),
        results_tx,
        config.scheduler_config(),
    )?;
    tracing::info!(
        streams,
        max_in_flight = scheduler.max_in_flight(),
        slot_mode = ?config.slot_mode,
        threshold = config.confidence_threshold,
        "Starting detection pipeline"
    );

    let decoders = spawn_decoders(&slots, producers, &cancel)?;
    let consumer = tokio::spawn(
        ResultConsumer::new(results_rx, sink).with_threshold(config.confidence_threshold).run(),
    );
    let loop_cancel = cancel.clone();
    let scheduled = tokio::task::spawn_blocking(move || scheduler.run(&loop_cancel))
        .await
        .map_err(|e| FrameKitError::Runtime(format!("detection loop task failed: {e}")))
        .and_then(|outcome| outcome);

    // Teardown: unblock decoders, then collect everything.
    finish_all(&slots);
    let producers = tokio::task::spawn_blocking(move || join_decoders(decoders))
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to join decoder threads");
            Vec::new()
        });
    let consumer = consumer.await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Result consumer task failed");
        ConsumerStats::default()
    });

    let scheduler = match scheduled {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!(error = %e, "Detection pipeline failed");
            return Err(e);
        },
    };
    let report = PipelineReport { scheduler, consumer, producers };
    tracing::info!(
        submitted = report.scheduler.submitted,
        delivered = report.scheduler.delivered,
        envelopes = report.consumer.envelopes,
        detections_kept = report.consumer.detections_kept,
        "Detection pipeline finished"
    );
    Ok(report)
}

fn spawn_decoders<P: FrameProducer + 'static>(
    slots: &[Arc<StreamSlot>],
    producers: Vec<P>,
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<ProducerStats>>> {
    let mut handles = Vec::with_capacity(slots.len());
    for (slot, mut producer) in slots.iter().cloned().zip(producers) {
        let id = slot.id();
        let cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("fk-decoder-{id}"))
            .spawn(move || run_producer(id, &slot, &mut producer, &cancel));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!(stream_id = id, error = %e, "Failed to spawn decoder thread");
                finish_all(slots);
                join_decoders(handles);
                return Err(FrameKitError::Io(e));
            },
        }
    }
    Ok(handles)
}

fn finish_all(slots: &[Arc<StreamSlot>]) {
    for slot in slots {
        slot.mark_finished(slot.id());
    }
}

fn join_decoders(handles: Vec<JoinHandle<ProducerStats>>) -> Vec<ProducerStats> {
    handles
        .into_iter()
        .enumerate()
        .map(|(id, handle)| {
            handle.join().unwrap_or_else(|_| {
                tracing::error!(stream_id = id, "Decoder thread panicked");
                ProducerStats::default()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_threshold_and_backoff() {
        assert!(PipelineConfig::default().validate().is_ok());

        let config = PipelineConfig { confidence_threshold: 1.5, ..PipelineConfig::default() };
        assert!(matches!(config.validate(), Err(FrameKitError::Configuration(_))));

        let config = PipelineConfig { confidence_threshold: f32::NAN, ..PipelineConfig::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { idle_backoff: Duration::ZERO, ..PipelineConfig::default() };
        assert!(config.validate().is_err());
    }
}
