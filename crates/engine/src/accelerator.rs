// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The inference accelerator seam.
//!
//! The scheduler only needs four things from a device: how many requests it can usefully run
//! at once, what the input tensor looks like, and an asynchronous submit/wait pair. The input
//! buffer is moved into the request and handed back on completion, so it is owned by exactly
//! one party at any time and returns to its pool on every exit path.

use framekit_core::{PoolOwner, Result};
use serde::{Deserialize, Serialize};

/// Memory layout of an input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TensorLayout {
    /// Interleaved channels: `[batch][height][width][channel]`.
    #[default]
    Nhwc,
}

/// Element type of an input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TensorPrecision {
    #[default]
    U8,
}

/// Shape of the single input tensor an accelerator expects (batch size 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub channels: usize,
    pub height: u32,
    pub width: u32,
    pub layout: TensorLayout,
    pub precision: TensorPrecision,
}

impl TensorDesc {
    /// 3-channel BGR, interleaved, 8 bits per channel.
    pub const fn bgr(width: u32, height: u32) -> Self {
        Self {
            channels: 3,
            height,
            width,
            layout: TensorLayout::Nhwc,
            precision: TensorPrecision::U8,
        }
    }

    /// Byte length of one tensor.
    pub const fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pooled input tensor. Dropping it returns the allocation to the scheduler's pool.
pub type TensorBuffer = PoolOwner<Vec<u8>>;

/// Raw `f32` output of one request together with its shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputBlob {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

/// A device able to run detection requests asynchronously.
///
/// Implementations must be usable from the scheduler thread while previously submitted
/// requests are still running.
pub trait InferenceAccelerator: Send + Sync {
    /// Handle to one outstanding request.
    type Request: Send;

    /// Maximum number of concurrent requests worth keeping in flight.
    fn optimal_concurrency(&self) -> usize;

    fn input_desc(&self) -> TensorDesc;

    /// Start a request on `input`.
    ///
    /// # Errors
    ///
    /// Returns `FrameKitError::Accelerator` if the device rejects the request.
    fn submit(&self, input: TensorBuffer) -> Result<Self::Request>;

    /// Block until `request` completes, returning its input buffer and output.
    ///
    /// # Errors
    ///
    /// Returns `FrameKitError::Accelerator` if the request failed on the device.
    fn wait(&self, request: Self::Request) -> Result<(TensorBuffer, OutputBlob)>;

    /// Synchronous submit-and-wait.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`submit`](Self::submit) and [`wait`](Self::wait).
    fn infer(&self, input: TensorBuffer) -> Result<(TensorBuffer, OutputBlob)> {
        let request = self.submit(input)?;
        self.wait(request)
    }
}
