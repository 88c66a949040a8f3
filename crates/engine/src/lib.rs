// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: Frame scheduling, detection and metrics aggregation for detkit.
//!
//! A stream of frames enters through a [`FrameScheduler`], which admits at most one
//! frame per cadence interval and one detection at a time. Admitted frames run
//! through the [`DetectionPipeline`] on the blocking pool; results are delivered on
//! a channel and timing records go to the shared [`MetricsAggregator`].

// --- Public Modules ---

pub mod constants;
pub mod decode;
pub mod error;
pub mod inference;
pub mod labels;
pub mod metrics;
pub mod mock;
pub mod pipeline;
pub mod preprocess;
pub mod scheduler;

#[cfg(feature = "onnx")]
pub mod onnx;

// Re-exports
pub use error::{InferenceError, PipelineError};
pub use inference::{load_backend, InferenceBackend};
pub use labels::LabelMap;
pub use metrics::{MetricsAggregator, MetricsConfig};
pub use mock::MockGenerator;
pub use pipeline::{DetectionPipeline, DetectionSource, PipelineConfig, PipelineStats};
pub use scheduler::{frame_interval, FrameScheduler, OfferOutcome};

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
