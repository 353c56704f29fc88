//! Training sessions for dirnet registration models.
//!
//! [`TrainingSession`] runs epochs of [`dirnet_model::RegistrationModel::fit`]
//! over a [`BatchSource`], with progress reporting, early stopping and
//! periodic checkpoints.

pub mod error;
pub mod progress;
pub mod session;

pub use error::{Result, TrainingError};
pub use progress::{
    ConsoleProgressCallback, EarlyStoppingCallback, HistoryCallback, ProgressCallback, ProgressInfo,
    ProgressTracker,
};
pub use session::{
    evaluate_source, BatchSource, InMemoryPairs, NiftiBatches, TrainingConfig, TrainingSession,
    TrainingSummary,
};
