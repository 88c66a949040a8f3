// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Integration tests for the detection pipeline's degraded modes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use detkit_core::geometry::iou;
use detkit_core::types::{Frame, RawScoreTensor, Tensor};
use detkit_engine::{
    DetectionPipeline, InferenceBackend, InferenceError, MockGenerator, PipelineConfig,
    PipelineStats,
};

fn frame(width: u32, height: u32, sequence_id: u64) -> Frame {
    Frame::new(vec![90u8; (width * height * 3) as usize], width, height, 1_000, sequence_id)
}

struct FailingBackend {
    calls: AtomicUsize,
}

impl InferenceBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    fn infer(&self, _tensor: &Tensor) -> Result<RawScoreTensor, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Failed("runtime not initialised".to_string()))
    }
}

/// Emits a grid of overlapping candidates in input pixel space.
struct GridBackend;

impl InferenceBackend for GridBackend {
    fn name(&self) -> &str {
        "grid"
    }

    fn infer(&self, tensor: &Tensor) -> Result<RawScoreTensor, InferenceError> {
        assert_eq!(tensor.shape(), [1, 3, 240, 320]);
        let mut values = Vec::new();
        let mut candidates = 0;
        for row in 0..8u8 {
            for col in 0..10u8 {
                let (r, c) = (f32::from(row), f32::from(col));
                let objectness = 0.45 + (r + c) / 40.0;
                values.extend_from_slice(&[c * 30.0 + 10.0, r * 28.0 + 12.0, 70.0, 60.0, objectness]);
                values.extend_from_slice(&[0.95, 0.6, 0.3]);
                candidates += 1;
            }
        }
        RawScoreTensor::new(values, [1, candidates, 8]).map_err(|e| InferenceError::Output(e.to_string()))
    }
}

fn assert_mock_prefix(detections: &[detkit_core::types::Detection]) {
    let mock = MockGenerator::canonical();
    assert!(detections.len() <= 2);
    assert_eq!(detections, &mock.pool()[..detections.len()]);
}

#[tokio::test]
async fn test_unset_backend_always_yields_mock_prefix() {
    let pipeline = Arc::new(DetectionPipeline::mock_only(PipelineConfig::default()));
    for seq in 0..50 {
        let result = pipeline.detect(frame(64, 48, seq)).await.unwrap();
        assert_eq!(result.frame_id, seq);
        assert_mock_prefix(&result.detections);
    }

    // Malformed frames never reach preprocessing without a backend
    let broken = Frame::new(vec![1u8; 3], 64, 48, 0, 99);
    assert!(pipeline.detect(broken).await.is_ok());
    assert_eq!(pipeline.stats(), PipelineStats { model_frames: 0, mock_frames: 51 });
}

#[tokio::test]
async fn test_failing_backend_degrades_to_mock() {
    let backend = Arc::new(FailingBackend { calls: AtomicUsize::new(0) });
    let pipeline = Arc::new(DetectionPipeline::new(
        PipelineConfig::default(),
        Some(Arc::clone(&backend) as Arc<dyn InferenceBackend>),
    ));

    for seq in 0..10 {
        let result = pipeline.detect(frame(640, 480, seq)).await.unwrap();
        assert_mock_prefix(&result.detections);
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 10);
    assert_eq!(pipeline.stats().mock_frames, 10);
}

#[tokio::test]
async fn test_model_output_respects_geometry_properties() {
    let pipeline = Arc::new(DetectionPipeline::new(
        PipelineConfig::default(),
        Some(Arc::new(GridBackend) as Arc<dyn InferenceBackend>),
    ));
    let result = pipeline.detect(frame(1280, 720, 1)).await.unwrap();

    assert!(!result.detections.is_empty());
    for det in &result.detections {
        assert!(det.is_well_formed(), "{det:?}");
        assert_eq!(det.label, "person");
    }
    for (i, a) in result.detections.iter().enumerate() {
        for b in &result.detections[i + 1..] {
            assert!(iou(a, b) <= 0.4);
            assert!(a.score >= b.score);
        }
    }
    assert_eq!(pipeline.stats().model_frames, 1);
}
