// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;
use std::sync::Arc;

use detkit_api::Mode;
use detkit_engine::{load_backend, DetectionPipeline, MetricsAggregator};

use crate::config::Config;
use crate::gateway::{GatewaySettings, PeerGateway};
use crate::transport::TransportConnector;

/// Shared by every handler and socket.
#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub mode: Mode,
    pub pipeline: Arc<DetectionPipeline>,
    pub metrics: Arc<MetricsAggregator>,
    pub gateway: Arc<PeerGateway>,
}

impl AppState {
    /// Builds the pipeline (loading the configured model, if any), the aggregator and
    /// the gateway. A model that fails to load leaves the pipeline in mock mode.
    pub fn new(config: Config, connector: Arc<dyn TransportConnector>) -> Self {
        let backend = load_backend(config.pipeline.model_path.as_deref().map(Path::new));
        let pipeline =
            Arc::new(DetectionPipeline::new(config.pipeline.to_pipeline_config(), backend));
        if !pipeline.has_backend() {
            tracing::info!("No inference backend loaded, serving mock detections");
        }

        let metrics = Arc::new(MetricsAggregator::new(config.metrics.to_metrics_config()));
        let gateway = PeerGateway::new(
            connector,
            Arc::clone(&pipeline),
            Arc::clone(&metrics),
            GatewaySettings::from_config(&config),
        );

        Self { mode: config.detection.mode, config: Arc::new(config), pipeline, metrics, gateway }
    }
}
