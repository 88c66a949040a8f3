// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared defaults for the detection pipeline, frame scheduler and metrics aggregator.
//!
//! Server config and engine configs should reference these constants so the
//! compiled defaults, the generated config file and the tests agree.
//!
//! # Cadence Guidelines
//!
//! The scheduler forwards at most one frame per `1000 / target_fps` ms and never
//! more than one at a time. Detection latency above that interval lowers the
//! effective rate further; the excess frames are dropped, never queued.

// === Detector Input ===

/// Width of the fixed detector input, in pixels.
pub const DEFAULT_INPUT_WIDTH: u32 = 320;

/// Height of the fixed detector input, in pixels.
pub const DEFAULT_INPUT_HEIGHT: u32 = 240;

/// Minimum objectness and class-weighted score for a candidate to survive decoding.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// IoU above which a lower-scoring detection is suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = detkit_core::geometry::DEFAULT_IOU_THRESHOLD;

// === Scheduling ===

/// Target detection cadence per stream.
///
/// Recommended:
/// - CPU inference at 320x240: 10-15
/// - GPU inference: 30
pub const DEFAULT_TARGET_FPS: u32 = 15;

/// Buffer size for per-stream result channels.
///
/// Results are small (a handful of boxes), so this mostly absorbs jitter on the
/// consumer side. A full channel delays the completing task, not the scheduler.
pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 32;

// === Metrics ===

/// Maximum number of frame timing records retained by the aggregator.
pub const DEFAULT_FRAME_CAPACITY: usize = 1000;

/// Maximum number of samples retained per bandwidth direction.
pub const DEFAULT_BANDWIDTH_CAPACITY: usize = 100;

/// Number of most recent records used by `recent_stats`.
pub const DEFAULT_RECENT_WINDOW: usize = 30;
