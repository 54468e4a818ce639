// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The detection loop.
//!
//! Streams are visited round-robin, one scan at a time, each scan starting one stream later
//! than the previous one. Before a stream is looked at, the in-flight queue is brought below
//! `max_in_flight` by completing its oldest request, so the accelerator never has more than
//! that many requests outstanding no matter how many streams there are.
//!
//! Results leave in submission order (global FIFO). A slow request therefore holds back the
//! results queued behind it even if those completed earlier; in exchange queue depth and
//! memory stay bounded by `max_in_flight`. Within a stream there is never more than one
//! request in flight, because the stream's only frame travels with it.
//!
//! Conversion failures only skip the frame at hand. Any accelerator failure ends the loop:
//! no new work is admitted, what is already in flight is drained, per-stream buffers are
//! released, the result channel is closed and the error is returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framekit_core::{
    BufferPool, FrameKitError, PoolStats, Result, SchedulerStats, StreamId, StreamSlot,
};
use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;

use crate::accelerator::{InferenceAccelerator, TensorDesc};
use crate::constants::{DEFAULT_IDLE_BACKOFF, DEFAULT_STATS_INTERVAL};
use crate::converter::FrameConverter;
use crate::result_channel::{ResultEnvelope, ResultSender};
use crate::ssd::decode_detections;
use crate::state::{InFlightRequest, PerStreamState};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep after a scan that found nothing to do.
    pub idle_backoff: Duration,
    /// Overrides the accelerator's capacity hint. Values below 1 are treated as 1.
    pub max_in_flight: Option<usize>,
    /// Minimum time between two stats log lines.
    pub stats_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_in_flight: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// What a single scan over all streams achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// This many streams had a frame submitted.
    Handled(usize),
    /// Nothing was submitted but some streams may still produce frames.
    Waiting,
    /// Nothing was submitted and every stream is finished.
    AllFinished,
}

enum StreamPoll {
    Submitted,
    Skipped,
    NotReady,
    Finished,
}

struct SchedulerMetrics {
    submitted: Counter<u64>,
    delivered: Counter<u64>,
    dropped: Counter<u64>,
    conversion_errors: Counter<u64>,
    in_flight: Gauge<u64>,
    wait_seconds: Histogram<f64>,
    /// Pre-built per-stream labels, reused on every request
    stream_labels: Vec<[KeyValue; 1]>,
}

impl SchedulerMetrics {
    fn new(streams: usize) -> Self {
        let meter = opentelemetry::global::meter("framekit_engine");
        let metrics = Self {
            submitted: meter
                .u64_counter("scheduler.requests_submitted")
                .with_description("Requests submitted to the inference accelerator")
                .build(),
            delivered: meter
                .u64_counter("scheduler.results_delivered")
                .with_description("Result envelopes accepted by the result channel")
                .build(),
            dropped: meter
                .u64_counter("scheduler.results_dropped")
                .with_description("Result envelopes dropped on a full or closed result channel")
                .build(),
            conversion_errors: meter
                .u64_counter("scheduler.conversion_errors")
                .with_description("Frames skipped because conversion into the input tensor failed")
                .build(),
            in_flight: meter
                .u64_gauge("scheduler.in_flight")
                .with_description("Accelerator requests currently in flight")
                .build(),
            wait_seconds: meter
                .f64_histogram("scheduler.request_wait_seconds")
                .with_description("Time spent blocked waiting for the oldest in-flight request")
                .build(),
            stream_labels: (0..streams)
                .map(|id| [KeyValue::new("stream_id", i64::try_from(id).unwrap_or(i64::MAX))])
                .collect(),
        };
        metrics.in_flight.record(0, &[]);
        metrics
    }
}

/// Map anything the accelerator returns to a fatal accelerator error.
fn accelerator_failure(operation: &'static str, err: FrameKitError) -> FrameKitError {
    if err.is_fatal() {
        err
    } else {
        FrameKitError::accelerator(operation, err.to_string())
    }
}

/// Round-robin, admission-controlled detection loop over a fixed set of streams.
///
/// Owns the in-flight queue, the per-stream states and the conversion buffers; none of them
/// are shared with other threads.
pub struct DetectionScheduler<A: InferenceAccelerator, C> {
    accelerator: Arc<A>,
    converter: C,
    slots: Vec<Arc<StreamSlot>>,
    states: Vec<Option<PerStreamState>>,
    in_flight: VecDeque<InFlightRequest<A::Request>>,
    max_in_flight: usize,
    desc: TensorDesc,
    buffers: BufferPool<Vec<u8>>,
    results: Option<ResultSender>,
    offset: usize,
    config: SchedulerConfig,
    stats: SchedulerStats,
    metrics: SchedulerMetrics,
    last_stats_log: Instant,
}

impl<A: InferenceAccelerator, C: FrameConverter> DetectionScheduler<A, C> {
    /// Build a scheduler over `slots`, where `slots[i]` must be the slot of stream `i`.
    ///
    /// # Errors
    ///
    /// Returns `FrameKitError::Configuration` for an empty or misnumbered slot list, or an
    /// accelerator with an empty input tensor.
    pub fn new(
        accelerator: Arc<A>,
        converter: C,
        slots: Vec<Arc<StreamSlot>>,
        results: ResultSender,
        config: SchedulerConfig,
    ) -> Result<Self> {
        if slots.is_empty() {
            return Err(FrameKitError::Configuration(
                "detection loop needs at least one stream".to_string(),
            ));
        }
        if let Some((index, slot)) = slots.iter().enumerate().find(|(i, slot)| slot.id() != *i) {
            return Err(FrameKitError::Configuration(format!(
                "slot at position {index} belongs to stream {}",
                slot.id()
            )));
        }
        let desc = accelerator.input_desc();
        if desc.is_empty() {
            return Err(FrameKitError::Configuration(format!(
                "accelerator input tensor is empty: {desc:?}"
            )));
        }

        let streams = slots.len();
        let max_in_flight =
            config.max_in_flight.unwrap_or_else(|| accelerator.optimal_concurrency()).max(1);
        let tensor_len = desc.len();

        Ok(Self {
            accelerator,
            converter,
            states: (0..streams).map(|_| None).collect(),
            slots,
            in_flight: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
            desc,
            // One conversion buffer per stream, allocated on the stream's first frame.
            buffers: BufferPool::with_factory(streams, move || vec![0u8; tensor_len]),
            results: Some(results),
            offset: 0,
            config,
            stats: SchedulerStats::for_streams(streams),
            metrics: SchedulerMetrics::new(streams),
            last_stats_log: Instant::now(),
        })
    }

    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub const fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn buffer_stats(&self) -> PoolStats {
        self.buffers.stats()
    }

    /// State of stream `id`, if it ever had a frame.
    pub fn stream_state(&self, id: StreamId) -> Option<&PerStreamState> {
        self.states.get(id).and_then(Option::as_ref)
    }

    /// Run until every stream is finished, `cancel` fires, or the accelerator fails.
    ///
    /// Blocks the calling thread. On every exit path the in-flight queue is drained, the
    /// per-stream buffers are released and the result channel is closed.
    ///
    /// # Errors
    ///
    /// Returns the first accelerator error.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<SchedulerStats> {
        tracing::info!(
            streams = self.slots.len(),
            max_in_flight = self.max_in_flight,
            "Detection loop started"
        );

        let outcome = self.run_loop(cancel);
        if let Err(e) = &outcome {
            tracing::error!(
                error = %e,
                in_flight = self.in_flight.len(),
                "Detection loop failed, draining in-flight requests"
            );
        }
        let drained = self.drain();
        self.shutdown();

        tracing::info!(
            scans = self.stats.scans,
            submitted = self.stats.submitted,
            delivered = self.stats.delivered,
            dropped_results = self.stats.dropped_results,
            conversion_errors = self.stats.conversion_errors,
            peak_in_flight = self.stats.peak_in_flight,
            "Detection loop stopped"
        );
        outcome.and(drained).map(|()| self.stats)
    }

    fn run_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(in_flight = self.in_flight.len(), "Detection loop cancelled");
                return Ok(());
            }
            match self.scan_once()? {
                ScanOutcome::Handled(_) => {},
                ScanOutcome::Waiting => {
                    if !self.finish_next()? {
                        self.stats.idle_sleeps += 1;
                        std::thread::sleep(self.config.idle_backoff);
                    }
                },
                ScanOutcome::AllFinished => {
                    tracing::debug!("All streams finished");
                    return Ok(());
                },
            }
            self.maybe_log_stats();
        }
    }

    /// Visit every stream once, starting from the rotating offset.
    ///
    /// # Errors
    ///
    /// Returns an accelerator error from a submission or from completing a request.
    pub fn scan_once(&mut self) -> Result<ScanOutcome> {
        let streams = self.slots.len();
        let start = self.offset;
        self.offset = (self.offset + 1) % streams;
        self.stats.scans += 1;

        let mut handled = 0;
        let mut finished = 0;
        for step in 0..streams {
            let id = (start + step) % streams;
            if self.in_flight.len() >= self.max_in_flight {
                self.finish_next()?;
            }
            match self.poll_stream(id)? {
                StreamPoll::Submitted => handled += 1,
                StreamPoll::Finished => finished += 1,
                StreamPoll::Skipped | StreamPoll::NotReady => {},
            }
        }

        Ok(if handled > 0 {
            ScanOutcome::Handled(handled)
        } else if finished == streams {
            ScanOutcome::AllFinished
        } else {
            ScanOutcome::Waiting
        })
    }

    fn poll_stream(&mut self, id: StreamId) -> Result<StreamPoll> {
        let slot = &self.slots[id];
        let Some(lease) = slot.try_consume(id) else {
            return Ok(if slot.is_finished() { StreamPoll::Finished } else { StreamPoll::NotReady });
        };
        let sequence = lease.sequence();

        let state = self.states[id].get_or_insert_with(|| {
            tracing::debug!(stream_id = id, "First frame, initialising stream state");
            PerStreamState::new(id, Arc::clone(slot))
        });
        let Some(mut buffer) = state.take_buffer(&self.buffers) else {
            self.stats.conversion_errors += 1;
            tracing::warn!(stream_id = id, sequence, "No conversion buffer left, skipping frame");
            return Ok(StreamPoll::Skipped);
        };

        if let Err(e) = self.converter.convert(lease.frame(), &self.desc, &mut buffer) {
            state.put_buffer(buffer);
            self.stats.conversion_errors += 1;
            self.metrics.conversion_errors.add(1, &self.metrics.stream_labels[id]);
            tracing::warn!(
                stream_id = id,
                sequence,
                error = %e,
                "Frame conversion failed, returning frame to producer"
            );
            return Ok(StreamPoll::Skipped);
        }

        let request =
            self.accelerator.submit(buffer).map_err(|e| accelerator_failure("submit", e))?;
        state.set_in_flight(true);
        self.in_flight.push_back(InFlightRequest {
            stream_id: id,
            sequence,
            lease,
            request,
            submitted_at: Instant::now(),
        });

        let in_flight = self.in_flight.len();
        self.stats.submitted_for(id, in_flight);
        self.metrics.submitted.add(1, &self.metrics.stream_labels[id]);
        self.metrics.in_flight.record(in_flight as u64, &[]);
        tracing::trace!(stream_id = id, sequence, in_flight, "Request submitted");
        Ok(StreamPoll::Submitted)
    }

    /// Complete the oldest in-flight request and pass its result on.
    ///
    /// Returns `false` when nothing was in flight. Not interruptible: once started, the wait
    /// runs to completion so no request is ever abandoned on the device.
    ///
    /// # Errors
    ///
    /// Returns the accelerator error if the request failed. Its frame is released.
    pub fn finish_next(&mut self) -> Result<bool> {
        let Some(InFlightRequest { stream_id, sequence, lease, request, submitted_at }) =
            self.in_flight.pop_front()
        else {
            return Ok(false);
        };

        let wait_started = Instant::now();
        let completed = self.accelerator.wait(request);
        self.metrics.wait_seconds.record(wait_started.elapsed().as_secs_f64(), &[]);
        self.metrics.in_flight.record(self.in_flight.len() as u64, &[]);

        let state = self.states[stream_id].as_mut();
        let (buffer, output) = match completed {
            Ok(completed) => completed,
            Err(e) => {
                if let Some(state) = state {
                    state.set_in_flight(false);
                }
                return Err(accelerator_failure("wait", e));
            },
        };
        if let Some(state) = state {
            state.set_in_flight(false);
            state.put_buffer(buffer);
        }

        match decode_detections(&output) {
            Ok(detections) => {
                tracing::trace!(
                    stream_id,
                    sequence,
                    detections = detections.len(),
                    latency_secs = submitted_at.elapsed().as_secs_f64(),
                    "Request completed"
                );
                self.deliver(ResultEnvelope::new(lease, detections));
            },
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::warn!(stream_id, sequence, error = %e, "Dropping undecodable result");
            },
        }
        Ok(true)
    }

    fn deliver(&mut self, envelope: ResultEnvelope) {
        let labels = &self.metrics.stream_labels[envelope.stream_id];
        let delivered = self.results.as_ref().is_some_and(|results| results.send(envelope));
        if delivered {
            self.stats.delivered();
            self.metrics.delivered.add(1, labels);
        } else {
            self.stats.dropped();
            self.metrics.dropped.add(1, labels);
        }
    }

    /// Complete every in-flight request in submission order.
    ///
    /// Keeps draining after a failure so no request is left on the device.
    ///
    /// # Errors
    ///
    /// Returns the first accelerator error seen.
    pub fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        while !self.in_flight.is_empty() {
            if let Err(e) = self.finish_next() {
                tracing::error!(
                    error = %e,
                    remaining = self.in_flight.len(),
                    "In-flight request failed while draining"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn shutdown(&mut self) {
        let initialised = self.states.iter().filter(|state| state.is_some()).count();
        for state in &mut self.states {
            *state = None;
        }
        tracing::debug!(
            initialised,
            buffers = ?self.buffers.stats(),
            "Released per-stream state"
        );
        if let Some(results) = self.results.take() {
            results.close();
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats_log.elapsed() < self.config.stats_interval {
            return;
        }
        self.last_stats_log = Instant::now();
        tracing::debug!(
            scans = self.stats.scans,
            submitted = self.stats.submitted,
            delivered = self.stats.delivered,
            dropped_results = self.stats.dropped_results,
            conversion_errors = self.stats.conversion_errors,
            idle_sleeps = self.stats.idle_sleeps,
            in_flight = self.in_flight.len(),
            "Detection loop stats"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::converter::ResizeConverter;
    use crate::result_channel::result_channel;
    use crate::sim::SimulatedAccelerator;
    use framekit_core::SlotMode;

    fn slots(count: usize) -> Vec<Arc<StreamSlot>> {
        (0..count).map(|id| Arc::new(StreamSlot::new(id, SlotMode::NonBlocking))).collect()
    }

    #[test]
    fn rejects_misnumbered_slots() {
        let (tx, _rx) = result_channel(2);
        let slots = vec![
            Arc::new(StreamSlot::new(0, SlotMode::NonBlocking)),
            Arc::new(StreamSlot::new(5, SlotMode::NonBlocking)),
        ];
        let result = DetectionScheduler::new(
            Arc::new(SimulatedAccelerator::new(TensorDesc::bgr(2, 2))),
            ResizeConverter,
            slots,
            tx,
            SchedulerConfig::default(),
        );
        assert!(matches!(result, Err(FrameKitError::Configuration(_))));
    }

    #[test]
    fn rejects_empty_stream_list() {
        let (tx, _rx) = result_channel(1);
        let result = DetectionScheduler::new(
            Arc::new(SimulatedAccelerator::new(TensorDesc::bgr(2, 2))),
            ResizeConverter,
            Vec::new(),
            tx,
            SchedulerConfig::default(),
        );
        assert!(matches!(result, Err(FrameKitError::Configuration(_))));
    }

    #[test]
    fn cap_defaults_to_capacity_hint_and_is_at_least_one() {
        let accelerator =
            Arc::new(SimulatedAccelerator::new(TensorDesc::bgr(2, 2)).with_concurrency(3));
        let (tx, _rx) = result_channel(2);
        let scheduler = DetectionScheduler::new(
            Arc::clone(&accelerator),
            ResizeConverter,
            slots(2),
            tx,
            SchedulerConfig::default(),
        )
        .unwrap();
        assert_eq!(scheduler.max_in_flight(), 3);

        let (tx, _rx) = result_channel(2);
        let config = SchedulerConfig { max_in_flight: Some(0), ..SchedulerConfig::default() };
        let scheduler =
            DetectionScheduler::new(accelerator, ResizeConverter, slots(2), tx, config).unwrap();
        assert_eq!(scheduler.max_in_flight(), 1);
    }

    #[test]
    fn state_is_created_lazily() {
        let accelerator = Arc::new(
            SimulatedAccelerator::new(TensorDesc::bgr(2, 2)).with_latency(Duration::ZERO),
        );
        let streams = slots(2);
        let (tx, mut rx) = result_channel(2);
        let mut scheduler = DetectionScheduler::new(
            accelerator,
            ResizeConverter,
            streams.clone(),
            tx,
            SchedulerConfig::default(),
        )
        .unwrap();

        assert_eq!(scheduler.scan_once().unwrap(), ScanOutcome::Waiting);
        assert!(scheduler.stream_state(0).is_none());
        assert_eq!(scheduler.buffer_stats().created, 0);

        let mut frame = streams[1].try_acquire_for_produce(1).unwrap();
        frame.resize(2, 2, framekit_core::PixelFormat::Bgr24);
        streams[1].mark_produced(1, frame);

        assert_eq!(scheduler.scan_once().unwrap(), ScanOutcome::Handled(1));
        assert!(scheduler.stream_state(0).is_none());
        assert!(scheduler.stream_state(1).is_some_and(PerStreamState::is_in_flight));
        assert_eq!(scheduler.buffer_stats().created, 1);

        assert!(scheduler.finish_next().unwrap());
        assert!(!scheduler.finish_next().unwrap());
        assert_eq!(rx.try_recv().unwrap().stream_id, 1);
    }
}
