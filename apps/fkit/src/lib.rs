// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

pub mod cli;
pub mod config;
pub mod export;
pub mod logging;
pub mod simulate;

// Re-export commonly used items for convenience
pub use config::Config;
pub use export::DetectionExporter;
