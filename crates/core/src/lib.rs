// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! detkit Core - Data model, geometry and statistics for real-time detection streaming.
//!
//! This crate defines the leaf abstractions shared by the detection engine and the server:
//!
//! ## Core Modules
//!
//! - [`types`]: Frames, tensors, detections and per-frame metric records
//! - [`geometry`]: Box math, IoU and greedy non-maximum suppression
//! - [`stats`]: Bounded sample rings and nearest-rank percentiles
//! - [`metrics`]: Serializable metric snapshot shapes
//! - [`error`]: Error types and handling
//!
//! ## Quick Start
//!
//! ```
//! use detkit_core::geometry::{iou, nms};
//! use detkit_core::types::Detection;
//!
//! let a = Detection::new("person", 0.9, 0.1, 0.1, 0.5, 0.5);
//! let b = Detection::new("person", 0.8, 0.12, 0.1, 0.52, 0.5);
//! assert!(iou(&a, &b) > 0.4);
//! assert_eq!(nms(vec![a, b], 0.4).len(), 1);
//! ```

pub mod error;
pub mod geometry;
pub mod metrics;
pub mod stats;
pub mod types;

// Error handling
pub use error::{DetkitError, Result};

// Data model
pub use types::{
    now_ms, BandwidthSample, Detection, DetectionResult, Frame, FrameMetricRecord, RawScoreTensor,
    Tensor,
};

// Geometry
pub use geometry::{iou, nms, BoundingBox};

// Statistics
pub use stats::{median, percentile, BoundedRing, Percentiles, StreamStats};

// Snapshots
pub use metrics::{BandwidthStats, LatencyStats, MetricsSnapshot, RecentStats, SummaryStats};
