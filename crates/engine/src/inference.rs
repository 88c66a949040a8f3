// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The inference capability seam.
//!
//! A backend maps a `[1, 3, H, W]` tensor to a `[1, D, 5 + C]` score tensor. It is
//! called from the blocking pool, so implementations may block for as long as the
//! model takes. Absence of a backend and failure of a call are handled the same way
//! by the pipeline: it degrades to mock output.

use std::path::Path;
use std::sync::Arc;

use detkit_core::types::{RawScoreTensor, Tensor};

use crate::error::InferenceError;

pub trait InferenceBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Runs the model on one tensor.
    ///
    /// # Errors
    ///
    /// Any [`InferenceError`]; the caller treats every variant as "inference unavailable
    /// for this frame".
    fn infer(&self, tensor: &Tensor) -> Result<RawScoreTensor, InferenceError>;
}

impl std::fmt::Debug for dyn InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceBackend").field("name", &self.name()).finish()
    }
}

/// Loads the backend for `model_path`, if one can be built.
///
/// Load failures are logged and yield `None`; the pipeline then runs in mock mode.
pub fn load_backend(model_path: Option<&Path>) -> Option<Arc<dyn InferenceBackend>> {
    model_path.and_then(load_model)
}

#[cfg(feature = "onnx")]
fn load_model(path: &Path) -> Option<Arc<dyn InferenceBackend>> {
    match crate::onnx::OnnxBackend::load(path) {
        Ok(backend) => {
            tracing::info!(model = %path.display(), "Loaded ONNX detection model");
            Some(Arc::new(backend))
        },
        Err(e) => {
            tracing::warn!(
                model = %path.display(),
                error = %e,
                "Failed to load detection model, falling back to mock detections"
            );
            None
        },
    }
}

#[cfg(not(feature = "onnx"))]
fn load_model(path: &Path) -> Option<Arc<dyn InferenceBackend>> {
    tracing::warn!(
        model = %path.display(),
        "model_path is set but this build has no ONNX support (enable the `onnx` feature); using mock detections"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_model_path_means_no_backend() {
        assert!(load_backend(None).is_none());
    }

    #[test]
    fn test_missing_model_file_degrades_to_none() {
        let path = Path::new("/nonexistent/detkit/model.onnx");
        assert!(load_backend(Some(path)).is_none());
    }
}
