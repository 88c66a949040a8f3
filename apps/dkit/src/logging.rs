// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{LogConfig, LogFormat, TelemetryConfig};
use crate::telemetry;

type DynLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

const fn more_verbose_level(a: tracing::Level, b: tracing::Level) -> tracing::Level {
    use tracing::Level;

    match (a, b) {
        (Level::TRACE, _) | (_, Level::TRACE) => Level::TRACE,
        (Level::DEBUG, _) | (_, Level::DEBUG) => Level::DEBUG,
        (Level::INFO, _) | (_, Level::INFO) => Level::INFO,
        (Level::WARN, _) | (_, Level::WARN) => Level::WARN,
        (Level::ERROR, Level::ERROR) => Level::ERROR,
    }
}

/// `RUST_LOG` wins over the configured level.
fn env_filter_or_level(default_level: tracing::Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

fn make_console_layer(console_level: tracing::Level) -> DynLayer {
    tracing_subscriber::fmt::layer().with_filter(env_filter_or_level(console_level)).boxed()
}

fn make_file_layer(
    non_blocking: NonBlocking,
    file_level: tracing::Level,
    file_format: LogFormat,
) -> DynLayer {
    match file_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .json()
            .with_filter(env_filter_or_level(file_level))
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(env_filter_or_level(file_level))
            .boxed(),
    }
}

fn open_log_file(
    log_config: &LogConfig,
) -> Result<(NonBlocking, WorkerGuard), Box<dyn std::error::Error>> {
    let log_path = Path::new(&log_config.file_path);
    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("dkit.log"));

    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log directory {}: {e}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
    Ok(tracing_appender::non_blocking(file_appender))
}

/// The span exporter sees everything either sink would.
fn otel_default_level(log_config: &LogConfig) -> tracing::Level {
    let console_level: tracing::Level = log_config.console_level.clone().into();
    let file_level: tracing::Level = log_config.file_level.clone().into();

    match (log_config.console_enable, log_config.file_enable) {
        (true, true) => more_verbose_level(console_level, file_level),
        (true, false) => console_level,
        (false, true) => file_level,
        (false, false) => tracing::Level::INFO,
    }
}

const fn should_enable_otel_tracing(telemetry_config: &TelemetryConfig) -> bool {
    telemetry_config.enable
        && telemetry_config.tracing_enable
        && telemetry_config.otlp_traces_endpoint.is_some()
}

/// Initialize logging based on configuration.
///
/// Console and file sinks are independent; if both are disabled the console is used
/// anyway. The OpenTelemetry span layer is only installed when a traces endpoint is set.
///
/// # Errors
///
/// Returns an error if:
/// - File logging is enabled but the log directory cannot be created
/// - OpenTelemetry span export cannot be initialized
pub fn init_logging(
    log_config: &LogConfig,
    telemetry_config: &TelemetryConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guard = None;
    let enable_otel = should_enable_otel_tracing(telemetry_config);
    let mut layers: Vec<DynLayer> = Vec::new();

    if log_config.file_enable {
        let (non_blocking, file_guard) = open_log_file(log_config)?;
        guard = Some(file_guard);
        layers.push(make_file_layer(
            non_blocking,
            log_config.file_level.clone().into(),
            log_config.file_format,
        ));
    }

    let console_fallback = !log_config.console_enable && !log_config.file_enable;
    if log_config.console_enable || console_fallback {
        let level =
            if console_fallback { tracing::Level::INFO } else { log_config.console_level.clone().into() };
        layers.push(make_console_layer(level));
    }

    if enable_otel {
        layers.push(
            telemetry::init_tracing_with_otlp(telemetry_config)?
                .with_filter(env_filter_or_level(otel_default_level(log_config)))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();

    if console_fallback {
        tracing::warn!("Both console and file logging are disabled, falling back to console logging");
    }
    if telemetry_config.enable
        && telemetry_config.tracing_enable
        && telemetry_config.otlp_traces_endpoint.is_none()
    {
        tracing::warn!(
            "OpenTelemetry tracing is enabled but `otlp_traces_endpoint` is not set; tracing is disabled"
        );
    }
    if enable_otel {
        tracing::info!("OpenTelemetry tracing layer enabled");
    }

    Ok(guard)
}
