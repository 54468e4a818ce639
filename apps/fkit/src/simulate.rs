// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `fkit run`: the detection pipeline over simulated decoders and a simulated accelerator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use framekit_engine::{
    run_pipeline, PipelineReport, ResizeConverter, SimulatedAccelerator, SyntheticProducer,
    TensorDesc,
};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SimulatorConfig};
use crate::export::DetectionExporter;

fn producers(sim: &SimulatorConfig) -> Vec<SyntheticProducer> {
    (0..sim.streams)
        .map(|id| {
            let producer = SyntheticProducer::new(sim.width, sim.height, sim.format)
                .with_tag(id as u64)
                .with_interval(Duration::from_millis(sim.interval_ms));
            match sim.frames {
                Some(frames) => producer.with_frame_count(frames),
                None => producer,
            }
        })
        .collect()
}

/// Run the simulated pipeline until every stream ends or `cancel` fires.
///
/// # Errors
///
/// Returns an error if the exporter can't open its outputs, the configuration is rejected,
/// or the accelerator fails.
pub async fn run(config: &Config, cancel: CancellationToken) -> anyhow::Result<PipelineReport> {
    let sim = &config.simulator;
    let accelerator = SimulatedAccelerator::new(TensorDesc::bgr(sim.input_size, sim.input_size))
        .with_concurrency(sim.concurrency)
        .with_latency(Duration::from_millis(sim.latency_ms));
    let exporter =
        DetectionExporter::create(&config.export).await.context("Failed to open export outputs")?;

    tracing::info!(
        streams = sim.streams,
        frames = ?sim.frames,
        width = sim.width,
        height = sim.height,
        format = ?sim.format,
        concurrency = sim.concurrency,
        "Starting simulated detection run"
    );

    run_pipeline(
        Arc::new(accelerator),
        ResizeConverter,
        producers(sim),
        exporter,
        config.pipeline.to_pipeline_config(),
        cancel,
    )
    .await
    .context("Detection pipeline failed")
}
