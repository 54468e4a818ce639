// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! An in-process stand-in for an inference accelerator.
//!
//! Each request runs on its own thread for a fixed latency and produces SSD-shaped output
//! with one confident and one weak detection. The accelerator records what it was asked to
//! do so callers can check ordering and concurrency after a run.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use framekit_core::{FrameKitError, Result};

use crate::accelerator::{InferenceAccelerator, OutputBlob, TensorBuffer, TensorDesc};
use crate::constants::{
    DEFAULT_SIMULATED_CONCURRENCY, DEFAULT_SIMULATED_INPUT_SIZE, DEFAULT_SIMULATED_LATENCY,
    SSD_ROW_SIZE,
};

/// Number of bytes of every submitted input kept by [`SimulatedAccelerator::submitted_headers`].
pub const RECORDED_HEADER_LEN: usize = 16;

#[derive(Debug, Default)]
struct Probe {
    headers: Vec<[u8; RECORDED_HEADER_LEN]>,
    outstanding: usize,
    peak_outstanding: usize,
    submits: u64,
    waits: u64,
}

/// Simulated accelerator. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct SimulatedAccelerator {
    desc: TensorDesc,
    concurrency: usize,
    latency: Duration,
    fail_on_submit: Option<u64>,
    fail_on_wait: Option<u64>,
    probe: Mutex<Probe>,
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(TensorDesc::bgr(DEFAULT_SIMULATED_INPUT_SIZE, DEFAULT_SIMULATED_INPUT_SIZE))
    }
}

impl SimulatedAccelerator {
    pub fn new(desc: TensorDesc) -> Self {
        Self {
            desc,
            concurrency: DEFAULT_SIMULATED_CONCURRENCY,
            latency: DEFAULT_SIMULATED_LATENCY,
            fail_on_submit: None,
            fail_on_wait: None,
            probe: Mutex::new(Probe::default()),
        }
    }

    /// Capacity hint reported through `optimal_concurrency`.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the `nth` call to `submit` (1-based) fail.
    #[must_use]
    pub const fn with_failure_on_submit(mut self, nth: u64) -> Self {
        self.fail_on_submit = Some(nth);
        self
    }

    /// Make the `nth` call to `wait` (1-based) fail.
    #[must_use]
    pub const fn with_failure_on_wait(mut self, nth: u64) -> Self {
        self.fail_on_wait = Some(nth);
        self
    }

    /// The first bytes of every input, in submission order.
    pub fn submitted_headers(&self) -> Vec<[u8; RECORDED_HEADER_LEN]> {
        self.probe().headers.clone()
    }

    pub fn submitted(&self) -> usize {
        self.probe().headers.len()
    }

    /// Requests submitted but not yet waited for.
    pub fn outstanding(&self) -> usize {
        self.probe().outstanding
    }

    /// Highest number of requests ever outstanding at once.
    pub fn peak_outstanding(&self) -> usize {
        self.probe().peak_outstanding
    }

    fn probe(&self) -> MutexGuard<'_, Probe> {
        self.probe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output() -> OutputBlob {
        // Two proposals and a terminator row.
        let rows: [[f32; SSD_ROW_SIZE]; 3] = [
            [0.0, 1.0, 0.92, 0.10, 0.15, 0.45, 0.60],
            [0.0, 2.0, 0.35, 0.50, 0.50, 0.90, 0.95],
            [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        OutputBlob { dims: vec![1, 1, rows.len(), SSD_ROW_SIZE], data: rows.concat() }
    }
}

/// One request running on a simulation thread.
#[derive(Debug)]
pub struct SimRequest {
    worker: JoinHandle<TensorBuffer>,
}

impl InferenceAccelerator for SimulatedAccelerator {
    type Request = SimRequest;

    fn optimal_concurrency(&self) -> usize {
        self.concurrency
    }

    fn input_desc(&self) -> TensorDesc {
        self.desc
    }

    fn submit(&self, input: TensorBuffer) -> Result<SimRequest> {
        let nth = {
            let mut probe = self.probe();
            probe.submits += 1;
            probe.submits
        };
        if self.fail_on_submit == Some(nth) {
            let message = format!("injected failure on submit {nth}");
            return Err(FrameKitError::accelerator("submit", message));
        }
        if input.len() != self.desc.len() {
            return Err(FrameKitError::accelerator(
                "submit",
                format!("input holds {} bytes, expected {}", input.len(), self.desc.len()),
            ));
        }

        let mut header = [0u8; RECORDED_HEADER_LEN];
        let len = input.len().min(RECORDED_HEADER_LEN);
        header[..len].copy_from_slice(&input[..len]);

        let latency = self.latency;
        let worker = std::thread::Builder::new()
            .name("fk-sim-request".to_string())
            .spawn(move || {
                std::thread::sleep(latency);
                input
            })
            .map_err(|e| FrameKitError::accelerator("submit", e.to_string()))?;

        let mut probe = self.probe();
        probe.headers.push(header);
        probe.outstanding += 1;
        probe.peak_outstanding = probe.peak_outstanding.max(probe.outstanding);
        tracing::trace!(outstanding = probe.outstanding, "Simulated request submitted");
        Ok(SimRequest { worker })
    }

    fn wait(&self, request: SimRequest) -> Result<(TensorBuffer, OutputBlob)> {
        let joined = request.worker.join();
        let nth = {
            let mut probe = self.probe();
            probe.outstanding = probe.outstanding.saturating_sub(1);
            probe.waits += 1;
            probe.waits
        };

        let input = joined
            .map_err(|_| FrameKitError::accelerator("wait", "simulation thread panicked"))?;
        if self.fail_on_wait == Some(nth) {
            let message = format!("injected failure on wait {nth}");
            return Err(FrameKitError::accelerator("wait", message));
        }
        Ok((input, Self::output()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ssd::decode_detections;
    use framekit_core::BufferPool;

    #[test]
    fn round_trip_returns_buffer_and_detections() {
        let desc = TensorDesc::bgr(4, 4);
        let pool = BufferPool::with_factory(2, move || vec![0u8; desc.len()]);
        let accelerator = SimulatedAccelerator::new(desc).with_latency(Duration::ZERO);

        let mut input = pool.try_acquire().unwrap();
        input[0] = 9;
        let (input, output) = accelerator.infer(input).unwrap();
        assert_eq!(input[0], 9);
        assert_eq!(accelerator.submitted_headers()[0][0], 9);

        let detections = decode_detections(&output).unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections[0].confidence > 0.9);
        assert!(detections[1].confidence < 0.5);

        drop(input);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn tracks_outstanding_requests() {
        let desc = TensorDesc::bgr(2, 2);
        let pool = BufferPool::with_factory(3, move || vec![0u8; desc.len()]);
        let accelerator = SimulatedAccelerator::new(desc).with_latency(Duration::from_millis(1));

        let requests: Vec<_> =
            (0..3).map(|_| accelerator.submit(pool.try_acquire().unwrap()).unwrap()).collect();
        assert_eq!(accelerator.outstanding(), 3);
        for request in requests {
            accelerator.wait(request).unwrap();
        }
        assert_eq!(accelerator.outstanding(), 0);
        assert_eq!(accelerator.peak_outstanding(), 3);
    }

    #[test]
    fn injected_failure_is_fatal_and_releases_input() {
        let desc = TensorDesc::bgr(2, 2);
        let pool = BufferPool::with_factory(1, move || vec![0u8; desc.len()]);
        let accelerator =
            SimulatedAccelerator::new(desc).with_latency(Duration::ZERO).with_failure_on_wait(1);

        let err = accelerator.infer(pool.try_acquire().unwrap()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn wrong_input_size_is_rejected() {
        let pool = BufferPool::with_factory(1, || vec![0u8; 5]);
        let accelerator = SimulatedAccelerator::new(TensorDesc::bgr(2, 2));
        assert!(accelerator.submit(pool.try_acquire().unwrap()).is_err());
        assert_eq!(accelerator.submitted(), 0);
    }
}
