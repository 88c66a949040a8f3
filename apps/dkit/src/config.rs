// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use detkit_api::Mode;
use detkit_core::{DetkitError, Result};
use detkit_engine::constants::{
    DEFAULT_BANDWIDTH_CAPACITY, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_FRAME_CAPACITY,
    DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH, DEFAULT_IOU_THRESHOLD,
    DEFAULT_RESULT_CHANNEL_CAPACITY, DEFAULT_RECENT_WINDOW, DEFAULT_TARGET_FPS,
};
use detkit_engine::{MetricsConfig, PipelineConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::Level;

/// Default config file looked up by `dkit serve`.
pub const DEFAULT_CONFIG_PATH: &str = "dkit.toml";

/// Prefix for environment overrides, e.g. `DK_SCHEDULER__TARGET_FPS=10`.
pub const ENV_PREFIX: &str = "DK_";

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for cross-origin requests.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests.
    /// Supports wildcards: "http://localhost:*" matches any port on localhost.
    /// Set to `["*"]` to allow all origins (e.g. a phone on the LAN).
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

const fn default_max_body_size() -> usize {
    // A raw 1920x1080 RGB frame is ~6 MB, ~8 MB once base64 encoded.
    16 * 1024 * 1024
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    pub address: String,
    /// Maximum request body size in bytes (bounds `/api/detect` frames).
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3001".to_string(),
            max_body_size: default_max_body_size(),
            cors: CorsConfig::default(),
        }
    }
}

/// Where detection runs. Advisory: every endpoint stays available in both modes.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct DetectionConfig {
    /// `"wasm"` (detect next to the camera) or `"server"` (stream frames here).
    #[serde(default)]
    #[schemars(with = "String")]
    pub mode: Mode,
}

/// Detector input geometry, thresholds and model location.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct PipelineSettings {
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// ONNX model to load at startup. Absent or unloadable means mock detections.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Class names in model output order; defaults to the COCO table.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            model_path: None,
            labels: None,
        }
    }
}

impl PipelineSettings {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            input_width: self.input_width,
            input_height: self.input_height,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            labels: self.labels.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SchedulerConfig {
    /// Maximum frames per second forwarded to detection, per stream.
    pub target_fps: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { target_fps: DEFAULT_TARGET_FPS }
    }
}

const fn default_watchdog_hz() -> u32 {
    60
}

const fn default_closed_client_memory() -> usize {
    256
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

/// Peer gateway settings for remote (`server`) mode.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct GatewayConfig {
    /// How often a bound video track is polled for a new frame.
    #[serde(default = "default_watchdog_hz")]
    pub watchdog_hz: u32,
    /// Buffered detection results per client before the bridge waits.
    #[serde(default = "default_result_channel_capacity")]
    pub result_channel_capacity: usize,
    /// How many removed client ids are remembered so late candidates stay no-ops.
    #[serde(default = "default_closed_client_memory")]
    pub closed_client_memory: usize,
    /// STUN/TURN URLs handed to the transport when a session is created.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

const fn default_result_channel_capacity() -> usize {
    DEFAULT_RESULT_CHANNEL_CAPACITY
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            watchdog_hz: default_watchdog_hz(),
            result_channel_capacity: default_result_channel_capacity(),
            closed_client_memory: default_closed_client_memory(),
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct MetricsSettings {
    /// Frame records retained for percentile computation.
    pub frame_capacity: usize,
    /// Samples retained per bandwidth direction.
    pub bandwidth_capacity: usize,
    /// Records considered by `/api/metrics/recent`.
    pub recent_window: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            bandwidth_capacity: DEFAULT_BANDWIDTH_CAPACITY,
            recent_window: DEFAULT_RECENT_WINDOW,
        }
    }
}

impl MetricsSettings {
    pub const fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            frame_capacity: self.frame_capacity,
            bandwidth_capacity: self.bandwidth_capacity,
            recent_window: self.recent_window,
        }
    }
}

/// Telemetry and observability configuration (OpenTelemetry).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Enable OpenTelemetry tracing (spans) export.
    ///
    /// Metrics export is controlled separately via `otlp_endpoint`.
    #[serde(default)]
    pub tracing_enable: bool,
    pub otlp_endpoint: Option<String>,
    /// OTLP endpoint for trace export (e.g., `http://localhost:4318/v1/traces`).
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

const fn default_true() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            tracing_enable: false,
            otlp_endpoint: None,
            otlp_traces_endpoint: None,
            otlp_headers: HashMap::new(),
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
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
            file_path: "./dkit.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Root configuration for the detkit server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Rejects values the pipeline, scheduler or aggregator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DetkitError::Configuration` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, message: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(DetkitError::Configuration(message.to_string()))
            }
        }

        let p = &self.pipeline;
        check(self.scheduler.target_fps > 0, "scheduler.target_fps must be greater than 0")?;
        check(p.input_width > 0, "pipeline.input_width must be greater than 0")?;
        check(p.input_height > 0, "pipeline.input_height must be greater than 0")?;
        check(
            (0.0..=1.0).contains(&p.confidence_threshold),
            "pipeline.confidence_threshold must be within [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&p.iou_threshold),
            "pipeline.iou_threshold must be within [0, 1]",
        )?;
        check(
            p.labels.as_ref().is_none_or(|labels| !labels.is_empty()),
            "pipeline.labels must not be empty when set",
        )?;
        check(self.gateway.watchdog_hz > 0, "gateway.watchdog_hz must be greater than 0")?;
        check(
            self.gateway.result_channel_capacity > 0,
            "gateway.result_channel_capacity must be greater than 0",
        )?;
        check(self.metrics.frame_capacity > 0, "metrics.frame_capacity must be greater than 0")?;
        check(
            self.metrics.bandwidth_capacity > 0,
            "metrics.bandwidth_capacity must be greater than 0",
        )?;
        check(self.metrics.recent_window > 0, "metrics.recent_window must be greater than 0")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

fn figment_for(config_path: &str) -> (Figment, Option<String>) {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
    let mut file_missing = None;

    // A missing file is not an error; defaults and env still apply.
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    (figment.merge(Env::prefixed(ENV_PREFIX).split("__")), file_missing)
}

/// Loads the configuration from defaults, a TOML file, and `DK_` environment variables,
/// then validates it.
///
/// # Errors
///
/// Returns `DetkitError::Configuration` if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
/// - A value fails validation (see [`Config::validate`])
pub fn load(config_path: &str) -> Result<ConfigLoadResult> {
    let (figment, file_missing) = figment_for(config_path);
    let config: Config =
        figment.extract().map_err(|e| DetkitError::Configuration(e.to_string()))?;
    config.validate()?;
    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> std::result::Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}
