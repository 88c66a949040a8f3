// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for detkit.
//!
//! Every failure in this system is scoped to a single frame or a single client
//! session. The variants below mirror that taxonomy so callers can decide whether
//! to drop a frame, degrade to mock output, or answer a client with an error.

use thiserror::Error;

/// Main error type for detkit operations.
#[derive(Debug, Error)]
pub enum DetkitError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Zero target FPS
    /// - Thresholds outside `[0, 1]`
    /// - Zero-sized model input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A frame could not be turned into a tensor.
    ///
    /// Fatal to that frame only: it is counted as dropped and no result is emitted.
    #[error("Preprocessing failure: {0}")]
    Preprocessing(String),

    /// The inference capability is missing or failed for this call.
    ///
    /// Recovered inside the pipeline by substituting mock output; it never reaches
    /// a caller of `detect`.
    #[error("Inference unavailable: {0}")]
    InferenceUnavailable(String),

    /// Session negotiation with a remote client failed.
    ///
    /// Surfaced to the requesting client as an explicit error response.
    #[error("Negotiation failure: {0}")]
    Negotiation(String),

    /// An operation addressed a removed or never-seen client.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error (file operations, model loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `DetkitError`.
pub type Result<T> = std::result::Result<T, DetkitError>;

impl From<DetkitError> for String {
    fn from(err: DetkitError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime
impl From<String> for DetkitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for DetkitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DetkitError::Configuration("target_fps must be greater than 0".to_string());
        assert_eq!(err.to_string(), "Configuration error: target_fps must be greater than 0");

        let err = DetkitError::Negotiation("remote description rejected".to_string());
        assert_eq!(err.to_string(), "Negotiation failure: remote description rejected");
    }

    #[test]
    fn test_error_to_string_conversion() {
        let err = DetkitError::Preprocessing("buffer too short".to_string());
        let s: String = err.into();
        assert_eq!(s, "Preprocessing failure: buffer too short");
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: DetkitError = "Something went wrong".into();
        assert_eq!(err.to_string(), "Runtime error: Something went wrong");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "model.onnx not found");
        let err: DetkitError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("model.onnx not found"));
    }
}
