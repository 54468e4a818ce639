// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: the multi-stream detection engine for FrameKit.
//!
//! Decoders publish frames into per-stream slots, a single detection loop feeds them to a
//! capacity-limited inference accelerator, and a cooperative consumer hands the results to
//! downstream markup before returning each frame to its decoder.

// --- Public Modules ---

pub mod accelerator;
pub mod constants;
pub mod consumer;
pub mod converter;
pub mod pipeline;
pub mod producer;
pub mod result_channel;
pub mod scheduler;
pub mod sim;
pub mod ssd;
pub mod state;

// Re-exports
pub use accelerator::{
    InferenceAccelerator, OutputBlob, TensorBuffer, TensorDesc, TensorLayout, TensorPrecision,
};
pub use consumer::{MarkupSink, ResultConsumer};
pub use converter::{FrameConverter, ResizeConverter};
pub use pipeline::{run_pipeline, PipelineConfig, PipelineReport};
pub use producer::{run_producer, FrameProducer, ProduceOutcome, SyntheticProducer};
pub use result_channel::{result_channel, ResultEnvelope, ResultReceiver, ResultSender};
pub use scheduler::{DetectionScheduler, ScanOutcome, SchedulerConfig};
pub use sim::{SimRequest, SimulatedAccelerator};
pub use ssd::decode_detections;
pub use state::PerStreamState;
