//! Error types for registration operations.
//!
//! Shape and geometry violations are detected at the first operation that can
//! observe them and surfaced synchronously. Numeric instability in the
//! similarity term is handled locally by epsilon flooring and never appears
//! here.

use thiserror::Error;

/// Main error type for registration operations.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Tensor dimensions violate a component contract.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensor rank is not supported by the operation.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A spatial axis has an extent that cannot be normalized.
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// Checkpoint parameters do not match the live architecture.
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    /// Checkpoint could not be read or written.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not available in the model's mode.
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// Diagnostic artifact could not be written.
    #[error("Export error: {0}")]
    Export(String),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Create a shape mismatch error from any pair of dimension slices.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create a degenerate geometry error.
    pub fn degenerate_geometry(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }

    /// Create a checkpoint mismatch error.
    pub fn checkpoint_mismatch(msg: impl Into<String>) -> Self {
        Self::CheckpointMismatch(msg.into())
    }

    /// Create a checkpoint I/O error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid mode error.
    pub fn invalid_mode(msg: impl Into<String>) -> Self {
        Self::InvalidMode(msg.into())
    }

    /// Create an export error.
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RegistrationError::degenerate_geometry("axis 0 has extent 0");
        assert!(matches!(err, RegistrationError::DegenerateGeometry(_)));
    }

    #[test]
    fn test_error_display() {
        let err = RegistrationError::invalid_mode("fit requires train mode");
        assert_eq!(err.to_string(), "Invalid mode: fit requires train mode");
    }

    #[test]
    fn test_shape_mismatch() {
        let err = RegistrationError::shape_mismatch(&[1, 3, 4, 4, 4], &[1, 2, 4, 4, 4]);
        let err_str = err.to_string();
        assert!(err_str.contains("expected"));
        assert!(err_str.contains("got"));
        assert!(err_str.contains("[1, 2, 4, 4, 4]"));
    }
}
