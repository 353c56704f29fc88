//! Epoch-driven training of a [`RegistrationModel`].
//!
//! A session pulls (moving, fixed) batches from a [`BatchSource`], takes one
//! optimization step per batch and reports the epoch means to its progress
//! callbacks. Checkpoints are written every `checkpoint_every` epochs and
//! once more when training ends.

use burn::config::Config;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use dirnet_io::{ExportOptions, NiftiPairDataset};
use dirnet_model::{LossReport, Mode, RegistrationModel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TrainingError;
use crate::progress::{ConsoleProgressCallback, EarlyStoppingCallback, ProgressCallback, ProgressInfo, ProgressTracker};

/// Indexed supply of (moving, fixed) batches.
pub trait BatchSource<B: Backend, const D: usize> {
    fn num_batches(&self) -> usize;

    /// Materialize batch `index` on `device`.
    fn batch(&self, index: usize, device: &B::Device) -> crate::error::Result<(Tensor<B, D>, Tensor<B, D>)>;
}

/// Batches already resident as tensors.
#[derive(Debug, Clone)]
pub struct InMemoryPairs<B: Backend, const D: usize> {
    batches: Vec<(Tensor<B, D>, Tensor<B, D>)>,
}

impl<B: Backend, const D: usize> InMemoryPairs<B, D> {
    pub fn new(batches: Vec<(Tensor<B, D>, Tensor<B, D>)>) -> Self {
        Self { batches }
    }

    /// A source yielding the same pair every epoch.
    pub fn single(moving: Tensor<B, D>, fixed: Tensor<B, D>) -> Self {
        Self::new(vec![(moving, fixed)])
    }
}

impl<B: Backend, const D: usize> BatchSource<B, D> for InMemoryPairs<B, D> {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batch(&self, index: usize, device: &B::Device) -> crate::error::Result<(Tensor<B, D>, Tensor<B, D>)> {
        let (moving, fixed) = self.batches.get(index).ok_or_else(|| {
            TrainingError::batch_source(format!(
                "batch {} requested from {} in-memory batches",
                index,
                self.batches.len()
            ))
        })?;
        Ok((moving.clone().to_device(device), fixed.clone().to_device(device)))
    }
}

/// Volume pairs read from disk in consecutive chunks of `batch_size`; the
/// last batch may be smaller.
#[derive(Debug, Clone)]
pub struct NiftiBatches {
    dataset: NiftiPairDataset,
    batch_size: usize,
}

impl NiftiBatches {
    pub fn new(dataset: NiftiPairDataset, batch_size: usize) -> crate::error::Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::invalid_configuration("batch size must be positive"));
        }
        if dataset.is_empty() {
            return Err(TrainingError::batch_source("dataset contains no volume pairs"));
        }
        Ok(Self { dataset, batch_size })
    }

    pub fn dataset(&self) -> &NiftiPairDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<B: Backend> BatchSource<B, 5> for NiftiBatches {
    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batch(&self, index: usize, device: &B::Device) -> crate::error::Result<(Tensor<B, 5>, Tensor<B, 5>)> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.dataset.len());
        self.dataset
            .load_batch(start..end, device)
            .map_err(|e| TrainingError::batch_source(format!("{:#}", e)))
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 1)]
    pub epochs: usize,
    /// Save a checkpoint every this many epochs; 0 keeps only the final one.
    #[config(default = 0)]
    pub checkpoint_every: usize,
    /// Checkpoint directory; no checkpoints are written without one.
    pub checkpoint_dir: Option<String>,
    #[config(default = "String::from(\"dirnet\")")]
    pub checkpoint_prefix: String,
    /// Epochs between console summaries.
    #[config(default = 1)]
    pub log_interval: usize,
    /// Stop after this many epochs without improvement.
    pub early_stopping_patience: Option<usize>,
    #[config(default = 1e-6)]
    pub early_stopping_min_improvement: f64,
}

impl TrainingConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.epochs == 0 {
            return Err(TrainingError::invalid_configuration("epochs must be positive"));
        }
        if self.checkpoint_prefix.is_empty() {
            return Err(TrainingError::invalid_configuration("checkpoint prefix must not be empty"));
        }
        // Checkpoint files take their extension from the base path.
        if self
            .checkpoint_prefix
            .contains(|c: char| c == '.' || std::path::is_separator(c))
        {
            return Err(TrainingError::invalid_configuration(format!(
                "checkpoint prefix {:?} must not contain '.' or path separators",
                self.checkpoint_prefix
            )));
        }
        if self.early_stopping_patience == Some(0) {
            return Err(TrainingError::invalid_configuration("early stopping patience must be positive"));
        }
        Ok(())
    }

    /// Checkpoint base path for `epoch`, or for the final checkpoint when
    /// `epoch` is `None`.
    pub fn checkpoint_path(&self, epoch: Option<usize>) -> Option<PathBuf> {
        let dir = PathBuf::from(self.checkpoint_dir.as_ref()?);
        let name = match epoch {
            Some(epoch) => format!("{}_epoch_{:04}", self.checkpoint_prefix, epoch),
            None => format!("{}_final", self.checkpoint_prefix),
        };
        Some(dir.join(name))
    }
}

/// Outcome of [`TrainingSession::run`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_completed: usize,
    /// Batch-averaged report of the last epoch.
    pub final_report: LossReport,
    pub stopped_early: bool,
    /// Base paths of the checkpoints written, in order.
    pub checkpoints: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Drives a train-mode [`RegistrationModel`] over a batch source.
pub struct TrainingSession<B: AutodiffBackend> {
    model: RegistrationModel<B>,
    config: TrainingConfig,
    tracker: ProgressTracker,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    /// # Errors
    /// * `InvalidConfiguration` for an invalid config or an infer-mode model
    pub fn new(model: RegistrationModel<B>, config: TrainingConfig) -> crate::error::Result<Self> {
        config.validate()?;
        if model.mode() != Mode::Train {
            return Err(TrainingError::invalid_configuration(
                "training sessions need a model built in train mode",
            ));
        }

        let mut tracker = ProgressTracker::new();
        tracker.add_callback(Arc::new(ConsoleProgressCallback::new(config.log_interval)));
        if let Some(patience) = config.early_stopping_patience {
            tracker.add_callback(Arc::new(EarlyStoppingCallback::new(
                config.early_stopping_min_improvement,
                patience,
            )));
        }

        Ok(Self { model, config, tracker })
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.tracker.add_callback(callback);
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &RegistrationModel<B> {
        &self.model
    }

    pub fn into_model(self) -> RegistrationModel<B> {
        self.model
    }

    /// Train for the configured number of epochs.
    ///
    /// Callbacks are told about failures before the error is returned.
    pub fn run<S, const D: usize>(&mut self, source: &S) -> crate::error::Result<TrainingSummary>
    where
        S: BatchSource<B, D>,
    {
        self.tracker.start();
        let result = self.run_epochs(source);
        if let Err(err) = &result {
            self.tracker.error(&err.to_string());
        }
        result
    }

    fn run_epochs<S, const D: usize>(&mut self, source: &S) -> crate::error::Result<TrainingSummary>
    where
        S: BatchSource<B, D>,
    {
        let num_batches = source.num_batches();
        if num_batches == 0 {
            return Err(TrainingError::batch_source("batch source is empty"));
        }
        tracing::info!(
            "Training for {} epochs over {} batches per epoch",
            self.config.epochs,
            num_batches
        );

        let mut checkpoints = Vec::new();
        let mut last = None;
        let mut epochs_completed = 0;
        let mut stopped_early = false;

        for epoch in 1..=self.config.epochs {
            let mut reports = Vec::with_capacity(num_batches);
            for index in 0..num_batches {
                let (moving, fixed) = source.batch(index, self.model.device())?;
                reports.push(self.model.fit(moving, fixed)?);
            }
            let report = mean_report(&reports);
            epochs_completed = epoch;
            last = Some(report);

            let mut info = ProgressInfo::new(
                epoch,
                Some(self.config.epochs),
                report.loss,
                Duration::ZERO,
                self.model.learning_rate(),
            )
            .with_terms(report.ncc(), report.smoothness_loss);
            info.add_metric("floored_fraction", report.floored_fraction);
            self.tracker.update(info);

            if self.config.checkpoint_every > 0 && epoch % self.config.checkpoint_every == 0 {
                if let Some(path) = self.config.checkpoint_path(Some(epoch)) {
                    self.model.save(&path)?;
                    checkpoints.push(path);
                }
            }

            if self.tracker.should_stop() {
                if epoch < self.config.epochs {
                    stopped_early = true;
                    tracing::info!("Stopping after epoch {}", epoch);
                }
                break;
            }
        }

        if let Some(path) = self.config.checkpoint_path(None) {
            self.model.save(&path)?;
            checkpoints.push(path);
        }

        let final_report = last.ok_or_else(|| TrainingError::invalid_configuration("no epoch completed"))?;
        let mut info = ProgressInfo::new(
            epochs_completed,
            Some(self.config.epochs),
            final_report.loss,
            Duration::ZERO,
            self.model.learning_rate(),
        )
        .with_terms(final_report.ncc(), final_report.smoothness_loss);
        info.add_metric("floored_fraction", final_report.floored_fraction);
        self.tracker.complete(info);

        Ok(TrainingSummary {
            epochs_completed,
            final_report,
            stopped_early,
            checkpoints,
            elapsed: self.tracker.elapsed(),
        })
    }
}

/// Evaluate every batch of `source` without updating parameters.
///
/// Exported sample files are numbered consecutively across batches, starting
/// from `export.start_index`. Returns the batch-averaged report.
pub fn evaluate_source<B, S, const D: usize>(
    model: &RegistrationModel<B>,
    source: &S,
    export: &ExportOptions,
) -> crate::error::Result<LossReport>
where
    B: AutodiffBackend,
    S: BatchSource<B, D>,
{
    let num_batches = source.num_batches();
    if num_batches == 0 {
        return Err(TrainingError::batch_source("batch source is empty"));
    }

    let mut reports = Vec::with_capacity(num_batches);
    let mut next_index = export.start_index;
    for index in 0..num_batches {
        let (moving, fixed) = source.batch(index, model.device())?;
        let batch = moving.dims()[0];
        let options = export.clone().with_start_index(next_index);
        let options = match &export.field_path {
            Some(path) if num_batches > 1 => options.with_field_path(indexed_path(path, index)),
            _ => options,
        };
        reports.push(model.evaluate(moving, fixed, &options)?);
        next_index += batch;
    }

    let report = mean_report(&reports);
    tracing::info!(
        "Evaluated {} batches: loss {:.6}, ncc {:.6}",
        num_batches,
        report.loss,
        report.ncc()
    );
    Ok(report)
}

/// `field.nii.gz` -> `field_3.nii.gz`, so batches do not overwrite each
/// other's field file.
fn indexed_path(path: &std::path::Path, index: usize) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("field.nii.gz");
    let (stem, extension) = match name.find('.') {
        Some(dot) => name.split_at(dot),
        None => (name, ""),
    };
    path.with_file_name(format!("{}_{}{}", stem, index, extension))
}

fn mean_report(reports: &[LossReport]) -> LossReport {
    let n = reports.len().max(1) as f64;
    let mut total = LossReport {
        loss: 0.0,
        similarity_loss: 0.0,
        smoothness_loss: 0.0,
        floored_fraction: 0.0,
    };
    for report in reports {
        total.loss += report.loss;
        total.similarity_loss += report.similarity_loss;
        total.smoothness_loss += report.smoothness_loss;
        total.floored_fraction += report.floored_fraction;
    }
    LossReport {
        loss: total.loss / n,
        similarity_loss: total.similarity_loss / n,
        smoothness_loss: total.smoothness_loss / n,
        floored_fraction: total.floored_fraction / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_checkpoint_paths() {
        let config = TrainingConfig::new().with_checkpoint_dir(Some("ckpt".to_string()));
        assert_eq!(config.checkpoint_path(Some(7)), Some(Path::new("ckpt").join("dirnet_epoch_0007")));
        assert_eq!(config.checkpoint_path(None), Some(Path::new("ckpt").join("dirnet_final")));
        assert_eq!(TrainingConfig::new().checkpoint_path(None), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainingConfig::new().validate().is_ok());
        assert!(TrainingConfig::new().with_epochs(0).validate().is_err());
        assert!(TrainingConfig::new().with_early_stopping_patience(Some(0)).validate().is_err());
    }

    #[test]
    fn test_checkpoint_prefix_without_dots_or_separators() {
        let prefix = |p: &str| TrainingConfig::new().with_checkpoint_prefix(p.to_string()).validate();
        assert!(prefix("run_v2").is_ok());
        assert!(prefix("run.v2").is_err());
        assert!(prefix("run.v2.final").is_err());
        assert!(prefix("runs/v2").is_err());
        assert!(prefix("").is_err());
    }

    #[test]
    fn test_indexed_field_path() {
        assert_eq!(
            indexed_path(Path::new("out/field.nii.gz"), 3),
            Path::new("out").join("field_3.nii.gz")
        );
        assert_eq!(indexed_path(Path::new("field"), 0), PathBuf::from("field_0"));
    }

    #[test]
    fn test_mean_report() {
        let a = LossReport {
            loss: -0.5,
            similarity_loss: -0.6,
            smoothness_loss: 0.1,
            floored_fraction: 0.0,
        };
        let b = LossReport {
            loss: -0.7,
            similarity_loss: -0.8,
            smoothness_loss: 0.3,
            floored_fraction: 0.5,
        };
        let mean = mean_report(&[a, b]);
        assert!((mean.loss + 0.6).abs() < 1e-12);
        assert!((mean.ncc() - 0.7).abs() < 1e-12);
        assert!((mean.smoothness_loss - 0.2).abs() < 1e-12);
        assert!((mean.floored_fraction - 0.25).abs() < 1e-12);
    }
}
