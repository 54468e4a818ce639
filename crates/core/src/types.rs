// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types that flow between decoders, the scheduler and result consumers.
//!
//! - [`Frame`]: the long-lived pixel buffer owned by a [`StreamSlot`](crate::slot::StreamSlot)
//! - [`PixelFormat`]: packed 8-bit layouts a frame can carry
//! - [`Detection`] / [`BoundingBox`]: one decoded accelerator proposal

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Index of a stream inside a scheduler (0-based, dense).
pub type StreamId = usize;

/// Packed 8-bit pixel layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgr24 | Self::Rgb24 => 3,
            Self::Gray8 => 1,
        }
    }

    /// Byte length of a tightly packed image in this format.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// A decoded video frame.
///
/// Frames are created by their slot and never change owner slot: `origin` is checked on
/// every handoff so a frame can't be returned to the wrong stream.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
    origin: u64,
}

impl Frame {
    pub(crate) const fn empty(origin: u64) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            format: PixelFormat::Bgr24,
            sequence: 0,
            origin,
        }
    }

    /// Reshape the frame, keeping the allocation when it is already large enough.
    pub fn resize(&mut self, width: u32, height: u32, format: PixelFormat) {
        let len = format.frame_len(width, height);
        self.data.resize(len, 0);
        self.width = width;
        self.height = height;
        self.format = format;
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    /// Producer-assigned frame number within its stream.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    pub const fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) const fn origin(&self) -> u64 {
        self.origin
    }

    /// True until the producer has filled the frame at least once.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Axis-aligned box in normalized `[0, 1]` image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub const fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    /// Scale to pixel coordinates `(x, y, width, height)` for an image of the given size.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let w = width as f32;
        let h = height as f32;
        let x0 = (self.x_min.clamp(0.0, 1.0) * w) as u32;
        let y0 = (self.y_min.clamp(0.0, 1.0) * h) as u32;
        let x1 = (self.x_max.clamp(0.0, 1.0) * w) as u32;
        let y1 = (self.y_max.clamp(0.0, 1.0) * h) as u32;
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

/// One detection proposal decoded from accelerator output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detection-target id within the batch (results are grouped by it).
    pub image_id: i32,
    pub class_id: i32,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}
