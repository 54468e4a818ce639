// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for FrameKit.
//!
//! Errors are split by the recovery policy attached to them: conversion and markup
//! failures stay local to a single frame, accelerator failures end the detection loop.
//! Slot protocol violations are not represented here at all; they panic.

use thiserror::Error;

/// Main error type for FrameKit operations.
#[derive(Debug, Error)]
pub enum FrameKitError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Zero streams requested
    /// - Confidence threshold outside `[0, 1]`
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Pixel conversion of a single frame failed.
    ///
    /// Only the current attempt for that stream is aborted; the frame goes back to its producer.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// The inference accelerator rejected a submission or failed while completing a request.
    ///
    /// Fatal to the detection loop.
    #[error("Accelerator error during {operation}: {message}")]
    Accelerator { operation: &'static str, message: String },

    /// Downstream markup/export failed for one result.
    #[error("Markup error: {0}")]
    Markup(String),

    /// I/O error (file operations, device access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource exhaustion or limit exceeded.
    ///
    /// Examples:
    /// - Conversion buffer pool exhausted
    /// - Result channel full
    #[error("Resource exhaustion: {0}")]
    ResourceExhausted(String),
}

impl FrameKitError {
    /// Shorthand for an accelerator failure in `operation` (`"submit"`, `"wait"`, ...).
    pub fn accelerator(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Accelerator { operation, message: message.into() }
    }

    /// Returns true when this error must stop the detection loop.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Accelerator { .. })
    }
}

/// Convenience type alias for Results using `FrameKitError`.
pub type Result<T> = std::result::Result<T, FrameKitError>;

// Backward compatibility: Allow conversion from FrameKitError to String
impl From<FrameKitError> for String {
    fn from(err: FrameKitError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime
impl From<String> for FrameKitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for FrameKitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
