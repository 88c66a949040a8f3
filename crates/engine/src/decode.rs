// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Score tensor decoding.
//!
//! Each candidate row is `[cx, cy, w, h, objectness, class_0 .. class_{C-1}]` in
//! detector input pixels. A row survives when both its objectness and its best
//! class-weighted score reach the confidence threshold. Surviving boxes are
//! converted to corners, divided by the input width and height, clipped to the unit
//! square and rounded for transport.

use detkit_core::geometry::BoundingBox;
use detkit_core::types::{Detection, RawScoreTensor, SCORE_ROW_PREFIX};

use crate::labels::LabelMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub input_width: f32,
    pub input_height: f32,
}

/// Decodes every candidate row in original order.
///
/// The output preserves candidate order so that suppression ties resolve to the
/// earlier candidate. Boxes that collapse to zero area after clipping and rounding
/// are discarded.
pub fn decode(raw: &RawScoreTensor, params: &DecodeParams, labels: &LabelMap) -> Vec<Detection> {
    let threshold = params.confidence_threshold;
    let mut detections = Vec::new();

    for row in raw.rows() {
        let objectness = row[4];
        if objectness.is_nan() || objectness < threshold {
            continue;
        }

        let Some((class_index, score)) = best_class(&row[SCORE_ROW_PREFIX..], objectness) else {
            continue;
        };
        if score < threshold {
            continue;
        }

        let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3])
            .normalized(params.input_width, params.input_height)
            .clipped();
        let detection = Detection::new(
            labels.label(class_index),
            score.min(1.0),
            bbox.xmin,
            bbox.ymin,
            bbox.xmax,
            bbox.ymax,
        )
        .rounded();

        if detection.is_well_formed() {
            detections.push(detection);
        }
    }

    detections
}

/// Argmax of `class_score * objectness`; the first index wins ties. NaN scores never win.
fn best_class(class_scores: &[f32], objectness: f32) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &class_score) in class_scores.iter().enumerate() {
        let weighted = class_score * objectness;
        if weighted.is_nan() {
            continue;
        }
        if best.is_none_or(|(_, current)| weighted > current) {
            best = Some((index, weighted));
        }
    }
    best
}
