// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry wiring: OTLP metric and span export, plus periodic gauges for
//! process load and live detection throughput.

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::{self as sdktrace, SdkTracerProvider},
    Resource,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing_opentelemetry::OpenTelemetryLayer;

use detkit_engine::MetricsAggregator;

use crate::config::TelemetryConfig;

const SERVICE_NAME: &str = "dkit";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

fn service_resource() -> Resource {
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

fn build_otlp_metric_exporter(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::MetricExporter, Box<dyn std::error::Error>> {
    let mut builder = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT);

    if !headers.is_empty() {
        tracing::info!(count = headers.len(), "Adding custom headers to OTLP metrics exporter");
        builder = builder.with_headers(headers.clone());
    }

    builder.build().map_err(|e| {
        tracing::error!(error = %e, "Failed to build OTLP metrics exporter");
        e.into()
    })
}

fn build_otlp_span_exporter(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::SpanExporter, Box<dyn std::error::Error>> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT);

    if !headers.is_empty() {
        tracing::info!(count = headers.len(), "Adding custom headers to OTLP trace exporter");
        builder = builder.with_headers(headers.clone());
    }

    builder.build().map_err(|e| {
        tracing::error!(error = %e, "Failed to build OTLP trace exporter");
        e.into()
    })
}

/// Initializes the global meter provider. Without an `otlp_endpoint`, instruments
/// are still created but nothing is exported.
///
/// # Errors
///
/// Returns an error if the OTLP metrics exporter fails to build.
pub fn init_metrics(
    config: &TelemetryConfig,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    let builder = SdkMeterProvider::builder().with_resource(service_resource());

    let provider = if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "Configuring OTLP metrics exporter");
        let exporter = build_otlp_metric_exporter(endpoint, &config.otlp_headers)?;
        let reader = PeriodicReader::builder(exporter).with_interval(Duration::from_secs(5)).build();
        builder.with_reader(reader).build()
    } else {
        tracing::info!("No OTLP endpoint configured, metrics will be collected but not exported");
        builder.build()
    };

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Initializes an OpenTelemetry tracing layer that exports spans via OTLP.
///
/// # Errors
///
/// Returns an error if `otlp_traces_endpoint` is missing or the exporter cannot be built.
pub fn init_tracing_with_otlp<S>(
    config: &TelemetryConfig,
) -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>, Box<dyn std::error::Error>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let endpoint = config
        .otlp_traces_endpoint
        .as_ref()
        .ok_or("Tracing is enabled but no `otlp_traces_endpoint` is configured")?;

    let exporter = build_otlp_span_exporter(endpoint, &config.otlp_headers)?;
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(service_resource())
        .build();

    let tracer = provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Publishes aggregator-derived gauges every `period`.
///
/// The aggregator keeps its own rings for the HTTP API; this only mirrors the headline
/// numbers into the meter provider so they reach the OTLP backend.
pub fn start_detection_metrics(metrics: Arc<MetricsAggregator>, period: Duration) {
    tokio::spawn(async move {
        let meter = global::meter("dkit_detection");
        let fps_gauge = meter
            .f64_gauge("detection.processed_fps")
            .with_description("Processed frames per second since the run started")
            .build();
        let drop_rate_gauge = meter
            .f64_gauge("detection.drop_rate")
            .with_description("Fraction of frames dropped since the run started")
            .build();
        let e2e_gauge = meter
            .f64_gauge("detection.e2e_latency_p95")
            .with_description("95th percentile end-to-end latency over retained frames")
            .with_unit("ms")
            .build();

        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let snapshot = metrics.snapshot();
            fps_gauge.record(snapshot.summary.processed_fps, &[]);
            drop_rate_gauge.record(snapshot.summary.drop_rate, &[]);
            e2e_gauge.record(snapshot.latency.e2e.p95, &[]);
        }
    });
}

/// Starts process CPU and memory gauges. Must be called inside the Tokio runtime.
pub fn start_system_metrics() {
    let system = Arc::new(Mutex::new(System::new()));

    tokio::spawn(async move {
        let meter = global::meter("dkit_system");
        let cpu_usage_gauge = meter
            .f64_gauge("system_cpu_utilization")
            .with_description("System-wide CPU utilization as a percentage")
            .with_unit("%")
            .build();
        let process_cpu_gauge = meter
            .f64_gauge("process_cpu_utilization")
            .with_description("Process CPU utilization normalized by number of CPUs")
            .with_unit("%")
            .build();
        let process_memory_gauge = meter
            .u64_gauge("process_memory_usage")
            .with_description("Process memory usage in bytes")
            .with_unit("By")
            .build();

        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            // The first tick fires immediately and establishes the CPU baseline.
            interval.tick().await;

            let system = Arc::clone(&system);
            #[allow(clippy::significant_drop_tightening)]
            let sample = tokio::task::spawn_blocking(move || {
                let mut sys = system.blocking_lock();
                sys.refresh_cpu_usage();

                #[allow(clippy::cast_precision_loss)]
                let cpu_count = sys.cpus().len().max(1) as f64;
                let cpu_usage: f64 =
                    sys.cpus().iter().map(|cpu| f64::from(cpu.cpu_usage())).sum::<f64>() / cpu_count;

                let process = sysinfo::get_current_pid().ok().and_then(|pid| {
                    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                    sys.process(pid)
                        .map(|p| (f64::from(p.cpu_usage()) / cpu_count, p.memory()))
                });
                (cpu_usage, process)
            })
            .await;

            match sample {
                Ok((cpu_usage, process)) => {
                    cpu_usage_gauge.record(cpu_usage, &[]);
                    if let Some((process_cpu, process_memory)) = process {
                        process_cpu_gauge.record(process_cpu, &[]);
                        process_memory_gauge.record(process_memory, &[]);
                    }
                    tracing::trace!(
                        target: "dkit::telemetry::system_metrics",
                        system_cpu_usage = cpu_usage,
                        "Collected system metrics"
                    );
                },
                Err(e) => tracing::warn!(error = %e, "Failed to collect system metrics"),
            }
        }
    });
}
