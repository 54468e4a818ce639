// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded channel carrying completed detections from the scheduler to the consumer.
//!
//! Capacity equals the number of streams. Each stream has at most one frame outside its slot,
//! so the channel can only fill up if admission accounting is broken. A full channel is
//! therefore logged as an error and the envelope dropped instead of blocking the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use framekit_core::{Detection, Frame, FrameLease, StreamId};
use tokio::sync::mpsc;

/// Detections for one frame, plus the lease that keeps the frame away from its producer
/// until the envelope is dropped.
#[derive(Debug)]
pub struct ResultEnvelope {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub detections: Vec<Detection>,
    lease: FrameLease,
}

impl ResultEnvelope {
    pub fn new(lease: FrameLease, detections: Vec<Detection>) -> Self {
        Self { stream_id: lease.stream_id(), sequence: lease.sequence(), detections, lease }
    }

    /// The frame the detections were computed on.
    pub fn frame(&self) -> &Frame {
        self.lease.frame()
    }

    /// Return the frame to its producer now.
    pub fn release(self) {
        self.lease.release();
    }
}

/// Create a result channel for `streams` streams.
pub fn result_channel(streams: usize) -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::channel(streams.max(1));
    let overflows = Arc::new(AtomicU64::new(0));
    (ResultSender { tx, overflows: Arc::clone(&overflows) }, ResultReceiver { rx, overflows })
}

/// Scheduler side. Closing is tied to ownership: [`close`](Self::close) consumes the sender.
#[derive(Debug)]
pub struct ResultSender {
    tx: mpsc::Sender<ResultEnvelope>,
    overflows: Arc<AtomicU64>,
}

impl ResultSender {
    /// Deliver without blocking. Returns `false` when the envelope was dropped.
    pub fn send(&self, envelope: ResultEnvelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    stream_id = envelope.stream_id,
                    sequence = envelope.sequence,
                    capacity = self.tx.max_capacity(),
                    "Result channel overflow, dropping detections"
                );
                false
            },
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                tracing::warn!(
                    stream_id = envelope.stream_id,
                    sequence = envelope.sequence,
                    "Result consumer is gone, dropping detections"
                );
                false
            },
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Close the channel. The consumer sees the end after draining what is queued.
    pub fn close(self) {
        tracing::debug!("Closing result channel");
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: mpsc::Receiver<ResultEnvelope>,
    overflows: Arc<AtomicU64>,
}

impl ResultReceiver {
    /// Next envelope, or `None` once the sender is closed and the queue is empty.
    pub async fn recv(&mut self) -> Option<ResultEnvelope> {
        self.rx.recv().await
    }

    /// Non-waiting variant of [`recv`](Self::recv) for callers driving the scheduler by hand.
    pub fn try_recv(&mut self) -> Option<ResultEnvelope> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    /// Number of envelopes the sender had to drop because the channel was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}
