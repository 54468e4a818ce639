// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Decoding of SSD-style detection output.
//!
//! The blob has shape `[1, 1, max_proposals, row_size]` with `row_size >= 7`. Each row is
//! `[image_id, label, confidence, x_min, y_min, x_max, y_max]` with box coordinates
//! normalized to the input image. A row with a negative `image_id` ends the list.

use framekit_core::{BoundingBox, Detection, FrameKitError, Result};

use crate::accelerator::OutputBlob;
use crate::constants::SSD_ROW_SIZE;

/// Decode every proposal in `blob`, regardless of confidence.
///
/// # Errors
///
/// Returns `FrameKitError::Runtime` when the blob shape is not SSD-like or the data is
/// shorter than the shape announces.
#[allow(clippy::cast_possible_truncation)]
pub fn decode_detections(blob: &OutputBlob) -> Result<Vec<Detection>> {
    let [_, _, proposals, row_size] = blob.dims[..] else {
        return Err(FrameKitError::Runtime(format!(
            "malformed detection output: expected 4 dimensions, got {:?}",
            blob.dims
        )));
    };
    if row_size < SSD_ROW_SIZE {
        return Err(FrameKitError::Runtime(format!(
            "malformed detection output: rows hold {row_size} values, need at least {SSD_ROW_SIZE}"
        )));
    }
    let needed = proposals.saturating_mul(row_size);
    if blob.data.len() < needed {
        return Err(FrameKitError::Runtime(format!(
            "malformed detection output: {} values for {proposals} rows of {row_size}",
            blob.data.len()
        )));
    }

    let detections = blob.data[..needed]
        .chunks_exact(row_size)
        .take_while(|row| row[0] >= 0.0)
        .map(|row| Detection {
            image_id: row[0] as i32,
            class_id: row[1] as i32,
            confidence: row[2],
            bbox: BoundingBox::new(row[3], row[4], row[5], row[6]),
        })
        .collect();
    Ok(detections)
}
