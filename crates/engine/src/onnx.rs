// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! ONNX Runtime detection backend.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use detkit_core::types::{RawScoreTensor, Tensor};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

use crate::error::InferenceError;
use crate::inference::InferenceBackend;

/// Runs a single-input, single-output detector exported as ONNX.
///
/// The session is not reentrant, so concurrent streams serialize on it.
#[derive(Debug)]
pub struct OnnxBackend {
    session: Mutex<Session>,
    path: PathBuf,
}

impl OnnxBackend {
    /// # Errors
    ///
    /// Returns [`InferenceError::Load`] if the session cannot be built or the file
    /// cannot be read.
    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let session = Session::builder()
            .map_err(|e| InferenceError::Load(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| InferenceError::Load(format!("Failed to set optimization level: {e}")))?
            .commit_from_file(path)
            .map_err(|e| {
                InferenceError::Load(format!("Failed to load model from '{}': {e}", path.display()))
            })?;

        Ok(Self { session: Mutex::new(session), path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn infer(&self, tensor: &Tensor) -> Result<RawScoreTensor, InferenceError> {
        let [batch, channels, height, width] = tensor.shape();
        let input = Array4::from_shape_vec((batch, channels, height, width), tensor.values().to_vec())
            .map_err(|e| InferenceError::Failed(format!("Failed to shape input tensor: {e}")))?;
        let input = Value::from_array(input)
            .map_err(|e| InferenceError::Failed(format!("Failed to convert input to Value: {e}")))?;

        let Ok(mut session) = self.session.lock() else {
            return Err(InferenceError::Failed("session lock poisoned".to_string()));
        };
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| InferenceError::Failed(format!("Detection inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Output(format!("Failed to extract scores: {e}")))?;

        let dims = shape
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InferenceError::Output(format!("dynamic output shape {shape:?}")))?;
        let &[batch, candidates, stride] = dims.as_slice() else {
            return Err(InferenceError::Output(format!(
                "expected a rank-3 score tensor, got shape {dims:?}"
            )));
        };

        RawScoreTensor::new(data.to_vec(), [batch, candidates, stride])
            .map_err(|e| InferenceError::Output(e.to_string()))
    }
}
