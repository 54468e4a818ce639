// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Detection export: JSON lines plus optional frame snapshots.
//!
//! Each detection group becomes one JSON object on its own line. Snapshots copy the frame
//! into a pooled buffer and hand it to a background writer task, which stores a binary PPM
//! image next to a JSON sidecar. Snapshot names cycle through 256 indices per stream, so the
//! directory never holds more than 256 images per stream. When every pooled buffer is
//! still queued for writing the snapshot is skipped; the frame is never held back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use framekit_core::{
    Detection, Frame, FrameKitError, PixelFormat, PoolOwner, PooledSender, Result,
};
use framekit_engine::{MarkupSink, ResultEnvelope};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ExportConfig;

/// One line of the detections file.
#[derive(Debug, Serialize)]
struct DetectionRecord<'a> {
    stream_id: usize,
    sequence: u64,
    image_id: i32,
    width: u32,
    height: u32,
    detections: &'a [Detection],
}

/// A frame copy waiting to be written. Lives in a pool and is reused.
#[derive(Debug, Default)]
struct Snapshot {
    stream_id: usize,
    sequence: u64,
    index: u8,
    image_id: i32,
    width: u32,
    height: u32,
    /// Packed RGB, as PPM wants it
    rgb: Vec<u8>,
    detections: Vec<Detection>,
}

impl Snapshot {
    fn fill(
        &mut self,
        envelope: &ResultEnvelope,
        index: u8,
        image_id: i32,
        detections: &[Detection],
    ) {
        let frame = envelope.frame();
        self.stream_id = envelope.stream_id;
        self.sequence = envelope.sequence;
        self.index = index;
        self.image_id = image_id;
        self.width = frame.width();
        self.height = frame.height();
        self.detections.clear();
        self.detections.extend_from_slice(detections);
        copy_as_rgb(frame, &mut self.rgb);
    }

    fn file_stem(&self) -> String {
        format!("stream{}_{:03}", self.stream_id, self.index)
    }

    fn ppm(&self) -> Vec<u8> {
        let header = format!("P6\n{} {}\n255\n", self.width, self.height);
        let mut out = Vec::with_capacity(header.len() + self.rgb.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.rgb);
        out
    }
}

#[derive(Serialize)]
struct Sidecar<'a> {
    stream_id: usize,
    sequence: u64,
    image_id: i32,
    width: u32,
    height: u32,
    detections: &'a [Detection],
}

fn copy_as_rgb(frame: &Frame, out: &mut Vec<u8>) {
    out.clear();
    let data = frame.data();
    match frame.format() {
        PixelFormat::Rgb24 => out.extend_from_slice(data),
        PixelFormat::Bgr24 => {
            out.extend(data.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]));
        },
        PixelFormat::Gray8 => out.extend(data.iter().flat_map(|&v| [v, v, v])),
    }
}

struct SnapshotQueue {
    sender: PooledSender<Snapshot>,
    writer: JoinHandle<u64>,
    /// Next rolling index per stream
    next_index: Vec<u8>,
    skipped: u64,
}

impl SnapshotQueue {
    fn next_index(&mut self, stream_id: usize) -> u8 {
        if self.next_index.len() <= stream_id {
            self.next_index.resize(stream_id + 1, 0);
        }
        let index = self.next_index[stream_id];
        self.next_index[stream_id] = index.wrapping_add(1);
        index
    }
}

async fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let stem = snapshot.file_stem();
    tokio::fs::write(dir.join(format!("{stem}.ppm")), snapshot.ppm()).await?;

    let sidecar = Sidecar {
        stream_id: snapshot.stream_id,
        sequence: snapshot.sequence,
        image_id: snapshot.image_id,
        width: snapshot.width,
        height: snapshot.height,
        detections: &snapshot.detections,
    };
    let json =
        serde_json::to_vec_pretty(&sidecar).map_err(|e| FrameKitError::Markup(e.to_string()))?;
    tokio::fs::write(dir.join(format!("{stem}.json")), json).await?;
    Ok(())
}

async fn run_snapshot_writer(dir: PathBuf, mut rx: mpsc::Receiver<PoolOwner<Snapshot>>) -> u64 {
    let mut written = 0;
    while let Some(snapshot) = rx.recv().await {
        match write_snapshot(&dir, &snapshot).await {
            Ok(()) => written += 1,
            Err(e) => tracing::warn!(
                stream_id = snapshot.stream_id,
                sequence = snapshot.sequence,
                error = %e,
                "Failed to write snapshot"
            ),
        }
        // Dropping the owner returns the buffer to the pool.
    }
    tracing::debug!(written, dir = %dir.display(), "Snapshot writer finished");
    written
}

/// [`MarkupSink`] that writes detections to disk.
pub struct DetectionExporter {
    lines: Option<BufWriter<File>>,
    snapshots: Option<SnapshotQueue>,
    records: u64,
    snapshots_written: u64,
}

impl DetectionExporter {
    /// Open the outputs named in `config`.
    ///
    /// Must be called from within a Tokio runtime when snapshots are enabled.
    ///
    /// # Errors
    ///
    /// Returns `FrameKitError::Io` if the detections file or snapshot directory can't be created.
    pub async fn create(config: &ExportConfig) -> Result<Self> {
        let lines = match &config.detections_path {
            Some(path) => Some(BufWriter::new(File::create(path).await?)),
            None => None,
        };

        let snapshots = match &config.snapshot_dir {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                tokio::fs::create_dir_all(&dir).await?;
                let (sender, rx) =
                    PooledSender::channel(config.snapshot_queue.max(1), Snapshot::default);
                let writer = tokio::spawn(run_snapshot_writer(dir, rx));
                Some(SnapshotQueue { sender, writer, next_index: Vec::new(), skipped: 0 })
            },
            None => None,
        };

        tracing::info!(
            detections_path = ?config.detections_path,
            snapshot_dir = ?config.snapshot_dir,
            "Detection exporter ready"
        );
        Ok(Self { lines, snapshots, records: 0, snapshots_written: 0 })
    }

    /// Detection groups written to the JSON-lines file so far.
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Snapshots written by the background writer. Final after `finish`.
    pub const fn snapshots_written(&self) -> u64 {
        self.snapshots_written
    }

    fn queue_snapshot(
        &mut self,
        envelope: &ResultEnvelope,
        image_id: i32,
        detections: &[Detection],
    ) {
        let Some(queue) = &mut self.snapshots else {
            return;
        };
        let Some(mut snapshot) = queue.sender.try_get() else {
            queue.skipped += 1;
            tracing::debug!(
                stream_id = envelope.stream_id,
                sequence = envelope.sequence,
                "Snapshot buffers busy, skipping snapshot"
            );
            return;
        };
        let index = queue.next_index(envelope.stream_id);
        snapshot.fill(envelope, index, image_id, detections);
        if !queue.sender.send(snapshot) {
            queue.skipped += 1;
        }
    }
}

#[async_trait]
impl MarkupSink for DetectionExporter {
    async fn markup(
        &mut self,
        envelope: &ResultEnvelope,
        image_id: i32,
        detections: &[Detection],
    ) -> Result<()> {
        self.queue_snapshot(envelope, image_id, detections);

        let Some(lines) = &mut self.lines else {
            return Ok(());
        };
        let frame = envelope.frame();
        let record = DetectionRecord {
            stream_id: envelope.stream_id,
            sequence: envelope.sequence,
            image_id,
            width: frame.width(),
            height: frame.height(),
            detections,
        };
        let mut line =
            serde_json::to_vec(&record).map_err(|e| FrameKitError::Markup(e.to_string()))?;
        line.push(b'\n');
        lines.write_all(&line).await?;
        self.records += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(lines) = &mut self.lines {
            lines.flush().await?;
        }
        if let Some(SnapshotQueue { sender, writer, skipped, .. }) = self.snapshots.take() {
            // Closing the channel lets the writer drain what is queued and exit.
            drop(sender);
            self.snapshots_written = writer.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Snapshot writer task failed");
                0
            });
            tracing::info!(written = self.snapshots_written, skipped, "Snapshots finished");
        }
        tracing::info!(records = self.records, "Detection export finished");
        Ok(())
    }
}
