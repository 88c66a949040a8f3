// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline-scoped errors.

use detkit_core::DetkitError;
use thiserror::Error;

/// Failure of the inference capability for one call.
///
/// Never escapes [`crate::pipeline::DetectionPipeline`]: it is logged at debug and
/// replaced with mock output.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The model could not be loaded.
    #[error("model load failed: {0}")]
    Load(String),

    /// The runtime rejected the input or failed while running.
    #[error("inference failed: {0}")]
    Failed(String),

    /// The model produced something other than a `[1, D, 5 + C]` score tensor.
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// Failure that prevents a frame from producing a result.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The frame could not be turned into a tensor. The frame is counted as dropped.
    #[error("Preprocessing failure: {0}")]
    Preprocessing(String),

    /// The blocking detection task panicked or was cancelled by runtime shutdown.
    #[error("detection task aborted: {0}")]
    Aborted(String),
}

impl From<InferenceError> for DetkitError {
    fn from(err: InferenceError) -> Self {
        Self::InferenceUnavailable(err.to_string())
    }
}

impl From<PipelineError> for DetkitError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Preprocessing(msg) => Self::Preprocessing(msg),
            PipelineError::Aborted(msg) => Self::Runtime(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_maps_into_core_taxonomy() {
        let err: DetkitError = PipelineError::Preprocessing("short buffer".into()).into();
        assert!(matches!(err, DetkitError::Preprocessing(ref m) if m == "short buffer"));

        let err: DetkitError = InferenceError::Failed("no session".into()).into();
        assert!(matches!(err, DetkitError::InferenceUnavailable(_)));
    }
}
