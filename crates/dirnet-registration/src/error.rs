//! Error types for training sessions.

use dirnet_core::RegistrationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    /// Failure inside the registration engine.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A batch could not be produced.
    #[error("Batch source error: {0}")]
    BatchSource(String),

    /// Invalid session configuration.
    #[error("Invalid training configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, TrainingError>;

impl TrainingError {
    pub fn batch_source(msg: impl Into<String>) -> Self {
        Self::BatchSource(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
