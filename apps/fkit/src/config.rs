// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use framekit_core::{PixelFormat, SlotMode};
use framekit_engine::constants::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IDLE_BACKOFF, DEFAULT_SIMULATED_CONCURRENCY,
    DEFAULT_SIMULATED_INPUT_SIZE, DEFAULT_SIMULATED_LATENCY, DEFAULT_STATS_INTERVAL,
};
use framekit_engine::PipelineConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format
    #[default]
    Text,
    /// JSON format, one object per line
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default) or "json"
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./fkit.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_confidence_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_idle_backoff_ms() -> u64 {
    duration_ms(DEFAULT_IDLE_BACKOFF)
}

const fn default_stats_interval_secs() -> u64 {
    DEFAULT_STATS_INTERVAL.as_secs()
}

/// Detection loop settings.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct PipelineSettings {
    /// "blocking": decoders wait for each frame to be consumed.
    /// "non_blocking": decoders drop frames while the previous one is still being processed.
    #[serde(default)]
    pub slot_mode: SlotMode,
    /// Detections must score strictly above this to be exported (default: 0.6)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Sleep after a scan that found no work, in milliseconds (default: 100)
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    /// Minimum time between detection loop stats log lines, in seconds (default: 10)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Cap on requests in flight. Defaults to the accelerator's capacity hint.
    pub max_in_flight: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            slot_mode: SlotMode::default(),
            confidence_threshold: default_confidence_threshold(),
            idle_backoff_ms: default_idle_backoff_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            max_in_flight: None,
        }
    }
}

impl PipelineSettings {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            slot_mode: self.slot_mode,
            confidence_threshold: self.confidence_threshold,
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
            max_in_flight: self.max_in_flight,
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }
}

/// Simulated decoders and accelerator used by `fkit run`.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SimulatorConfig {
    /// Number of concurrent streams
    pub streams: usize,
    /// Frames per stream. Unset runs until interrupted.
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Time spent decoding each frame, in milliseconds
    pub interval_ms: u64,
    /// Time each accelerator request takes, in milliseconds
    pub latency_ms: u64,
    /// Capacity hint reported by the accelerator
    pub concurrency: usize,
    /// Square edge of the accelerator's input tensor, in pixels
    pub input_size: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            streams: 4,
            frames: Some(100),
            width: 640,
            height: 480,
            format: PixelFormat::Bgr24,
            interval_ms: 33,
            latency_ms: duration_ms(DEFAULT_SIMULATED_LATENCY),
            concurrency: DEFAULT_SIMULATED_CONCURRENCY,
            input_size: DEFAULT_SIMULATED_INPUT_SIZE,
        }
    }
}

const fn default_snapshot_queue() -> usize {
    4
}

/// Where detection results go.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ExportConfig {
    /// JSON-lines file receiving one record per detection group. Unset disables it.
    pub detections_path: Option<String>,
    /// Directory for PPM frame snapshots with JSON sidecars. Unset disables snapshots.
    pub snapshot_dir: Option<String>,
    /// Snapshots waiting to be written; further snapshots are skipped (default: 4)
    #[serde(default = "default_snapshot_queue")]
    pub snapshot_queue: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            detections_path: Some("./detections.jsonl".to_string()),
            snapshot_dir: None,
            snapshot_queue: default_snapshot_queue(),
        }
    }
}

/// Root configuration for fkit.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub simulator: SimulatorConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration from defaults, a TOML file, and `FK_` environment variables.
///
/// Nested keys use `__`, e.g. `FK_PIPELINE__SLOT_MODE=non_blocking`.
///
/// # Errors
///
/// Returns an error if the file exists but is invalid TOML, or if a value has the wrong type.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // A missing file is fine; the caller reports it once logging is up.
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("FK_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    #[test]
    fn default_config_round_trips_through_toml() {
        let rendered = generate_default().unwrap();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&rendered))
            .extract()
            .unwrap();
        assert_eq!(config.pipeline.slot_mode, SlotMode::Blocking);
        assert_eq!(config.simulator.streams, 4);
        assert!(config.export.snapshot_dir.is_none());
    }

    #[test]
    fn pipeline_settings_map_to_engine_config() {
        let settings = PipelineSettings {
            slot_mode: SlotMode::NonBlocking,
            idle_backoff_ms: 5,
            max_in_flight: Some(3),
            ..PipelineSettings::default()
        };
        let config = settings.to_pipeline_config();
        assert_eq!(config.slot_mode, SlotMode::NonBlocking);
        assert_eq!(config.idle_backoff, Duration::from_millis(5));
        assert_eq!(config.max_in_flight, Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("[pipeline]\nslot_mode = \"non_blocking\"\n"))
            .extract()
            .unwrap();
        assert_eq!(config.pipeline.slot_mode, SlotMode::NonBlocking);
        assert!((config.pipeline.confidence_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.simulator.concurrency, DEFAULT_SIMULATED_CONCURRENCY);
    }

    #[test]
    fn defaults_match_engine_constants() {
        let config = Config::default();
        let pipeline = config.pipeline.to_pipeline_config();
        assert_eq!(pipeline.idle_backoff, DEFAULT_IDLE_BACKOFF);
        assert_eq!(pipeline.stats_interval, DEFAULT_STATS_INTERVAL);
        assert_eq!(Duration::from_millis(config.simulator.latency_ms), DEFAULT_SIMULATED_LATENCY);
    }
}
