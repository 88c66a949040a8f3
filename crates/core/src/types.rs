// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types that flow through detkit pipelines.
//!
//! - [`Frame`]: A captured RGB image, owned by whichever stage currently holds it
//! - [`Tensor`]: The planar, normalized model input derived from a frame
//! - [`RawScoreTensor`]: Opaque detector output interpreted as `[1, D, 5 + C]`
//! - [`Detection`] / [`DetectionResult`]: What is sent back to the viewer
//! - [`FrameMetricRecord`] / [`BandwidthSample`]: Inputs to the metrics aggregator
//!
//! All timestamps are milliseconds since the UNIX epoch; all latencies are milliseconds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use ts_rs::TS;

use crate::error::{DetkitError, Result};

/// Number of interleaved channels in a frame's pixel buffer (RGB).
pub const FRAME_CHANNELS: usize = 3;

/// Fixed per-candidate prefix in a score row: `cx, cy, w, h, objectness`.
pub const SCORE_ROW_PREFIX: usize = 5;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A single captured video frame (8-bit interleaved RGB).
///
/// The pixel buffer is reference counted and never mutated after handoff; a stage
/// either consumes the frame or drops it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: Bytes,
    pub width: u32,
    pub height: u32,
    /// When the capture source produced the frame.
    pub capture_ts: u64,
    pub sequence_id: u64,
    /// When the frame was pulled off a remote track (remote mode only).
    pub recv_ts: Option<u64>,
}

impl Frame {
    pub fn new(
        pixels: impl Into<Bytes>,
        width: u32,
        height: u32,
        capture_ts: u64,
        sequence_id: u64,
    ) -> Self {
        Self { pixels: pixels.into(), width, height, capture_ts, sequence_id, recv_ts: None }
    }

    #[must_use]
    pub const fn with_recv_ts(mut self, recv_ts: u64) -> Self {
        self.recv_ts = Some(recv_ts);
        self
    }

    /// Byte length a well-formed buffer of this size must have.
    pub const fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * FRAME_CHANNELS
    }
}

/// Planar float32 image tensor, channel-major (CHW), values in `[0, 1]`.
///
/// Shape is always `(1, 3, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    values: Vec<f32>,
    shape: [usize; 4],
}

impl Tensor {
    /// Wraps CHW values for a single RGB image.
    ///
    /// # Errors
    ///
    /// Returns `DetkitError::Preprocessing` if `values` does not hold exactly
    /// `3 * height * width` elements.
    pub fn from_chw(values: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        let expected = FRAME_CHANNELS * height * width;
        if values.len() != expected {
            return Err(DetkitError::Preprocessing(format!(
                "tensor holds {} values, expected {expected} for 3x{height}x{width}",
                values.len()
            )));
        }
        Ok(Self { values, shape: [1, FRAME_CHANNELS, height, width] })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    pub const fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub const fn height(&self) -> usize {
        self.shape[2]
    }

    pub const fn width(&self) -> usize {
        self.shape[3]
    }
}

/// Detector output laid out as `[1, D, 5 + C]`.
///
/// Each row is `[center_x, center_y, width, height, objectness, class_score_0 .. class_score_{C-1}]`
/// in the detector's input-pixel coordinate space.
#[derive(Debug, Clone, PartialEq)]
pub struct RawScoreTensor {
    values: Vec<f32>,
    candidates: usize,
    stride: usize,
}

impl RawScoreTensor {
    /// # Errors
    ///
    /// Returns `DetkitError::InferenceUnavailable` when the shape is not `[1, D, 5 + C]`
    /// with `C >= 1`, or when `values` does not match the shape.
    pub fn new(values: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let [batch, candidates, stride] = shape;
        if batch != 1 {
            return Err(DetkitError::InferenceUnavailable(format!(
                "expected batch size 1, got {batch}"
            )));
        }
        if stride <= SCORE_ROW_PREFIX {
            return Err(DetkitError::InferenceUnavailable(format!(
                "score rows need at least {} columns, got {stride}",
                SCORE_ROW_PREFIX + 1
            )));
        }
        if values.len() != candidates * stride {
            return Err(DetkitError::InferenceUnavailable(format!(
                "score tensor holds {} values, shape implies {}",
                values.len(),
                candidates * stride
            )));
        }
        Ok(Self { values, candidates, stride })
    }

    pub const fn candidate_count(&self) -> usize {
        self.candidates
    }

    pub const fn class_count(&self) -> usize {
        self.stride - SCORE_ROW_PREFIX
    }

    /// Candidate rows in their original order.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.values.chunks_exact(self.stride)
    }
}

/// A labelled box in normalized `[0, 1]` coordinates relative to the original frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Detection {
    pub fn new(
        label: impl Into<String>,
        score: f32,
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    ) -> Self {
        Self { label: label.into(), score, xmin, ymin, xmax, ymax }
    }

    /// Rounds the score to 2 decimals and coordinates to 3 decimals for transport.
    #[must_use]
    pub fn rounded(self) -> Self {
        use crate::geometry::round_to;
        Self {
            score: round_to(self.score, 2),
            xmin: round_to(self.xmin, 3),
            ymin: round_to(self.ymin, 3),
            xmax: round_to(self.xmax, 3),
            ymax: round_to(self.ymax, 3),
            label: self.label,
        }
    }

    /// Whether the box is non-degenerate and fully inside the unit square.
    pub fn is_well_formed(&self) -> bool {
        (0.0..=1.0).contains(&self.score)
            && 0.0 <= self.xmin
            && self.xmin < self.xmax
            && self.xmax <= 1.0
            && 0.0 <= self.ymin
            && self.ymin < self.ymax
            && self.ymax <= 1.0
    }
}

/// The outcome of running one frame through the detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DetectionResult {
    pub frame_id: u64,
    pub capture_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub recv_ts: Option<u64>,
    pub inference_ts: u64,
    pub detections: Vec<Detection>,
}

/// Timing record for one frame that completed the full pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FrameMetricRecord {
    pub frame_id: u64,
    pub capture_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub recv_ts: Option<u64>,
    pub inference_ts: u64,
    pub e2e_latency: f64,
    pub server_latency: f64,
    pub network_latency: f64,
    pub recorded_at: u64,
}

impl FrameMetricRecord {
    /// Derives latencies from a result's timestamps as observed at `displayed_at`.
    ///
    /// Server latency is measured from `recv_ts` when the frame crossed the network,
    /// otherwise from capture. Network latency is zero for local frames.
    #[allow(clippy::cast_precision_loss)] // millisecond deltas stay far below 2^52
    pub fn from_timestamps(
        frame_id: u64,
        capture_ts: u64,
        recv_ts: Option<u64>,
        inference_ts: u64,
        displayed_at: u64,
    ) -> Self {
        let server_start = recv_ts.unwrap_or(capture_ts);
        Self {
            frame_id,
            capture_ts,
            recv_ts,
            inference_ts,
            e2e_latency: displayed_at.saturating_sub(capture_ts) as f64,
            server_latency: inference_ts.saturating_sub(server_start) as f64,
            network_latency: recv_ts.map_or(0.0, |recv| recv.saturating_sub(capture_ts) as f64),
            recorded_at: displayed_at,
        }
    }

    pub fn from_result(result: &DetectionResult, displayed_at: u64) -> Self {
        Self::from_timestamps(
            result.frame_id,
            result.capture_ts,
            result.recv_ts,
            result.inference_ts,
            displayed_at,
        )
    }
}

/// One bandwidth observation in kilobits per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BandwidthSample {
    pub timestamp: u64,
    pub kbps: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_expected_len() {
        let frame = Frame::new(vec![0u8; 12], 2, 2, 0, 1);
        assert_eq!(frame.expected_len(), 12);
        assert_eq!(frame.recv_ts, None);
        assert_eq!(frame.with_recv_ts(42).recv_ts, Some(42));
    }

    #[test]
    fn test_tensor_rejects_wrong_length() {
        assert!(Tensor::from_chw(vec![0.0; 3 * 4 * 5], 4, 5).is_ok());
        let err = Tensor::from_chw(vec![0.0; 10], 4, 5).unwrap_err();
        assert!(matches!(err, DetkitError::Preprocessing(_)));
    }

    #[test]
    fn test_raw_score_tensor_shape_validation() {
        let raw = RawScoreTensor::new(vec![0.0; 2 * 7], [1, 2, 7]).unwrap();
        assert_eq!(raw.candidate_count(), 2);
        assert_eq!(raw.class_count(), 2);
        assert_eq!(raw.rows().count(), 2);

        assert!(RawScoreTensor::new(vec![0.0; 14], [2, 1, 7]).is_err());
        assert!(RawScoreTensor::new(vec![0.0; 10], [1, 2, 5]).is_err());
        assert!(RawScoreTensor::new(vec![0.0; 13], [1, 2, 7]).is_err());
    }

    #[test]
    fn test_detection_rounding() {
        let det = Detection::new("person", 0.876_54, 0.123_456, 0.1, 0.987_654, 0.5).rounded();
        assert!((det.score - 0.88).abs() < f32::EPSILON);
        assert!((det.xmin - 0.123).abs() < f32::EPSILON);
        assert!((det.xmax - 0.988).abs() < f32::EPSILON);
    }

    #[test]
    fn test_metric_record_latencies() {
        let local = FrameMetricRecord::from_timestamps(1, 1_000, None, 1_040, 1_100);
        assert!((local.e2e_latency - 100.0).abs() < f64::EPSILON);
        assert!((local.server_latency - 40.0).abs() < f64::EPSILON);
        assert!(local.network_latency.abs() < f64::EPSILON);

        let remote = FrameMetricRecord::from_timestamps(2, 1_000, Some(1_030), 1_050, 1_120);
        assert!((remote.network_latency - 30.0).abs() < f64::EPSILON);
        assert!((remote.server_latency - 20.0).abs() < f64::EPSILON);
        assert_eq!(remote.recorded_at, 1_120);
    }

    #[test]
    fn test_detection_result_wire_shape() {
        let result = DetectionResult {
            frame_id: 7,
            capture_ts: 10,
            recv_ts: None,
            inference_ts: 20,
            detections: vec![Detection::new("chair", 0.72, 0.1, 0.2, 0.3, 0.4)],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["frame_id"], 7);
        assert!(json.get("recv_ts").is_none());
        assert_eq!(json["detections"][0]["label"], "chair");
    }
}
