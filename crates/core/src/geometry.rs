// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Box geometry: intersection-over-union and greedy non-maximum suppression.
//!
//! Suppression is O(n²) in the number of candidates that survive the confidence
//! filter. Those counts are in the tens, so no spatial index is used.

use crate::types::Detection;

/// Default IoU above which a lower-scoring box is suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.4;

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BoundingBox {
    pub const fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// Converts a center-form box (`cx, cy, w, h`) to corner form.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        let half_w = w / 2.0;
        let half_h = h / 2.0;
        Self { xmin: cx - half_w, ymin: cy - half_h, xmax: cx + half_w, ymax: cy + half_h }
    }

    /// Divides each axis by its own extent; the two axes are scaled independently.
    #[must_use]
    pub fn normalized(self, width: f32, height: f32) -> Self {
        Self {
            xmin: self.xmin / width,
            ymin: self.ymin / height,
            xmax: self.xmax / width,
            ymax: self.ymax / height,
        }
    }

    #[must_use]
    pub fn clipped(self) -> Self {
        Self {
            xmin: self.xmin.clamp(0.0, 1.0),
            ymin: self.ymin.clamp(0.0, 1.0),
            xmax: self.xmax.clamp(0.0, 1.0),
            ymax: self.ymax.clamp(0.0, 1.0),
        }
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }

    /// Standard intersection-over-union; exactly 0 for boxes that do not intersect.
    pub fn iou(&self, other: &Self) -> f32 {
        let left = self.xmin.max(other.xmin);
        let top = self.ymin.max(other.ymin);
        let right = self.xmax.min(other.xmax);
        let bottom = self.ymax.min(other.ymax);

        if right < left || bottom < top {
            return 0.0;
        }

        let intersection = (right - left) * (bottom - top);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

impl From<&Detection> for BoundingBox {
    fn from(det: &Detection) -> Self {
        Self::new(det.xmin, det.ymin, det.xmax, det.ymax)
    }
}

/// IoU of two detections' boxes.
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    BoundingBox::from(a).iou(&BoundingBox::from(b))
}

/// Greedy non-maximum suppression.
///
/// Detections are ordered by score, highest first; equal scores keep their input
/// order. Walking that order, a detection is kept only if its IoU with every
/// already-kept detection is at most `iou_threshold`. The returned list is in
/// kept order, so `nms(nms(d)) == nms(d)`.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    // sort_by is stable
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Rounds to a fixed number of decimal places.
pub fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

/// `f64` counterpart of [`round_to`], used for presentation of aggregated metrics.
pub fn round_to_f64(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
