// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The detection pipeline: preprocess, infer, decode, suppress.
//!
//! ```text
//! Frame ─▶ preprocess ─▶ Tensor ─▶ backend.infer ─▶ RawScoreTensor ─▶ decode ─▶ nms ─▶ DetectionResult
//!                                       │ absent or failed
//!                                       └──────────────────▶ mock prefix ───────────────▶ DetectionResult
//! ```
//!
//! Only preprocessing can fail a frame. Inference problems degrade to mock output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use detkit_core::geometry::nms;
use detkit_core::types::{now_ms, Detection, DetectionResult, Frame};
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH,
    DEFAULT_IOU_THRESHOLD,
};
use crate::decode::{decode, DecodeParams};
use crate::error::PipelineError;
use crate::inference::InferenceBackend;
use crate::labels::LabelMap;
use crate::mock::MockGenerator;
use crate::preprocess::preprocess;

/// Detector input geometry and filtering thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Class names in model output order. `None` uses the COCO table.
    pub labels: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_width: DEFAULT_INPUT_WIDTH,
            input_height: DEFAULT_INPUT_HEIGHT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            labels: None,
        }
    }
}

/// Where a result's detections came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    Model,
    Mock,
}

impl DetectionSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Mock => "mock",
        }
    }
}

/// Frames served by each source since the pipeline was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub model_frames: u64,
    pub mock_frames: u64,
}

pub struct DetectionPipeline {
    config: PipelineConfig,
    backend: Option<Arc<dyn InferenceBackend>>,
    labels: LabelMap,
    mock: MockGenerator,
    model_frames: AtomicU64,
    mock_frames: AtomicU64,
    frames_counter: opentelemetry::metrics::Counter<u64>,
    duration_histogram: opentelemetry::metrics::Histogram<f64>,
}

impl std::fmt::Debug for DetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPipeline")
            .field("config", &self.config)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl DetectionPipeline {
    pub fn new(config: PipelineConfig, backend: Option<Arc<dyn InferenceBackend>>) -> Self {
        let meter = global::meter("detkit_engine");
        let frames_counter = meter
            .u64_counter("pipeline.frames")
            .with_description("Frames run through the detection pipeline, by detection source")
            .build();
        let duration_histogram = meter
            .f64_histogram("pipeline.duration")
            .with_description("Time from preprocessing start to suppressed detections")
            .with_unit("s")
            .with_boundaries(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
            .build();

        let labels = config.labels.clone().map_or_else(LabelMap::coco, LabelMap::from_names);

        Self {
            config,
            backend,
            labels,
            mock: MockGenerator::canonical(),
            model_frames: AtomicU64::new(0),
            mock_frames: AtomicU64::new(0),
            frames_counter,
            duration_histogram,
        }
    }

    /// A pipeline with no inference backend; every result comes from the mock pool.
    pub fn mock_only(config: PipelineConfig) -> Self {
        Self::new(config, None)
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            model_frames: self.model_frames.load(Ordering::Relaxed),
            mock_frames: self.mock_frames.load(Ordering::Relaxed),
        }
    }

    /// Runs one frame through the pipeline on the calling thread.
    ///
    /// Without a backend there is nothing to feed, so the frame is not preprocessed
    /// and the call cannot fail.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Preprocessing`] when a backend is configured and the
    /// frame cannot be converted to a tensor.
    pub fn detect_blocking(&self, frame: &Frame) -> Result<DetectionResult, PipelineError> {
        let started = Instant::now();

        let (detections, source) = match &self.backend {
            None => (self.mock.generate(), DetectionSource::Mock),
            Some(backend) => self.run_backend(backend.as_ref(), frame)?,
        };

        match source {
            DetectionSource::Model => self.model_frames.fetch_add(1, Ordering::Relaxed),
            DetectionSource::Mock => self.mock_frames.fetch_add(1, Ordering::Relaxed),
        };
        self.frames_counter.add(1, &[KeyValue::new("source", source.as_str())]);
        self.duration_histogram.record(started.elapsed().as_secs_f64(), &[]);

        tracing::trace!(
            frame_id = frame.sequence_id,
            source = source.as_str(),
            detections = detections.len(),
            "Frame processed"
        );

        Ok(DetectionResult {
            frame_id: frame.sequence_id,
            capture_ts: frame.capture_ts,
            recv_ts: frame.recv_ts,
            inference_ts: now_ms(),
            detections,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn run_backend(
        &self,
        backend: &dyn InferenceBackend,
        frame: &Frame,
    ) -> Result<(Vec<Detection>, DetectionSource), PipelineError> {
        let tensor = preprocess(frame, self.config.input_width, self.config.input_height)?;

        match backend.infer(&tensor) {
            Ok(raw) => {
                let params = DecodeParams {
                    confidence_threshold: self.config.confidence_threshold,
                    input_width: tensor.width() as f32,
                    input_height: tensor.height() as f32,
                };
                let decoded = decode(&raw, &params, &self.labels);
                Ok((nms(decoded, self.config.iou_threshold), DetectionSource::Model))
            },
            Err(e) => {
                tracing::debug!(
                    frame_id = frame.sequence_id,
                    backend = backend.name(),
                    error = %e,
                    "Inference unavailable, using mock detections"
                );
                Ok((self.mock.generate(), DetectionSource::Mock))
            },
        }
    }

    /// Runs [`Self::detect_blocking`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Preprocessing failures, or [`PipelineError::Aborted`] if the blocking task
    /// panicked or the runtime is shutting down.
    pub async fn detect(self: &Arc<Self>, frame: Frame) -> Result<DetectionResult, PipelineError> {
        let pipeline = Arc::clone(self);
        tokio::task::spawn_blocking(move || pipeline.detect_blocking(&frame))
            .await
            .map_err(|e| PipelineError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use detkit_core::types::{RawScoreTensor, Tensor};

    struct FixedBackend(Vec<f32>, usize);

    impl InferenceBackend for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }

        fn infer(&self, _tensor: &Tensor) -> Result<RawScoreTensor, InferenceError> {
            RawScoreTensor::new(self.0.clone(), [1, self.1, 7])
                .map_err(|e| InferenceError::Output(e.to_string()))
        }
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![128u8; (width * height * 3) as usize], width, height, 1_000, 3)
    }

    #[test]
    fn test_model_path_decodes_and_suppresses() {
        // Two heavily overlapping candidates of the same object plus a distinct one
        let rows = vec![
            160.0, 120.0, 64.0, 48.0, 0.9, 0.9, 0.0, //
            162.0, 120.0, 64.0, 48.0, 0.8, 0.9, 0.0, //
            40.0, 40.0, 20.0, 20.0, 0.9, 0.0, 0.7,
        ];
        let backend: Arc<dyn InferenceBackend> = Arc::new(FixedBackend(rows, 3));
        let pipeline = DetectionPipeline::new(PipelineConfig::default(), Some(backend));

        let result = pipeline.detect_blocking(&frame(640, 480)).unwrap();
        assert_eq!(result.frame_id, 3);
        assert_eq!(result.capture_ts, 1_000);
        assert!(result.inference_ts >= result.capture_ts);

        let labels: Vec<&str> = result.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "bicycle"]);
        assert_eq!(pipeline.stats(), PipelineStats { model_frames: 1, mock_frames: 0 });
    }

    #[test]
    fn test_preprocessing_failure_propagates_with_backend() {
        let backend: Arc<dyn InferenceBackend> = Arc::new(FixedBackend(Vec::new(), 0));
        let pipeline = DetectionPipeline::new(PipelineConfig::default(), Some(backend));
        let broken = Frame::new(vec![0u8; 5], 4, 4, 0, 1);
        assert!(matches!(
            pipeline.detect_blocking(&broken),
            Err(PipelineError::Preprocessing(_))
        ));
        assert_eq!(pipeline.stats(), PipelineStats::default());
    }

    #[test]
    fn test_recv_ts_carried_through() {
        let pipeline = DetectionPipeline::mock_only(PipelineConfig::default());
        let result = pipeline.detect_blocking(&frame(8, 8).with_recv_ts(1_020)).unwrap();
        assert_eq!(result.recv_ts, Some(1_020));
        assert_eq!(pipeline.stats().mock_frames, 1);
    }
}
