//! Trainable registration unit: predictor, resampler and objective.

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use dirnet_core::{
    ExecutionContext, RegistrationError, SpatialResampler, SpatialResamplerConfig,
};
use dirnet_io::{export_diagnostics, ExportOptions};
use std::path::Path;

use crate::checkpoint;
use crate::losses::{LossBreakdown, RegistrationLoss, RegistrationLossConfig};
use crate::network::{FieldPredictor, FieldPredictorConfig};

/// Whether a model may update its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Infer,
}

#[derive(Config, Debug)]
pub struct RegistrationConfig {
    pub predictor: FieldPredictorConfig,
    #[config(default = "RegistrationLossConfig::new()")]
    pub loss: RegistrationLossConfig,
    #[config(default = "SpatialResamplerConfig::new()")]
    pub resampler: SpatialResamplerConfig,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Adam first-moment decay.
    #[config(default = 0.9)]
    pub beta_1: f32,
    /// Adam second-moment decay.
    #[config(default = 0.999)]
    pub beta_2: f32,
    #[config(default = 1e-5)]
    pub adam_epsilon: f32,
}

impl RegistrationConfig {
    pub fn validate(&self) -> dirnet_core::Result<()> {
        self.predictor.validate()?;
        self.loss.validate()?;
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "learning rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        let betas_valid = [self.beta_1, self.beta_2]
            .iter()
            .all(|beta| (0.0..1.0).contains(beta));
        if !betas_valid || !(self.adam_epsilon.is_finite() && self.adam_epsilon > 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "Adam needs betas in [0, 1) and a positive epsilon, got beta_1={}, beta_2={}, epsilon={}",
                self.beta_1, self.beta_2, self.adam_epsilon
            )));
        }
        Ok(())
    }

    fn optimizer<B: AutodiffBackend>(&self) -> PredictorOptimizer<B> {
        AdamConfig::new()
            .with_beta_1(self.beta_1)
            .with_beta_2(self.beta_2)
            .with_epsilon(self.adam_epsilon)
            .init()
    }
}

/// Scalar objective values of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReport {
    /// `similarity_loss + lambda * smoothness_loss`.
    pub loss: f64,
    /// Negated NCC.
    pub similarity_loss: f64,
    /// Unweighted smoothness penalty.
    pub smoothness_loss: f64,
    /// Share of NCC statistics floored by epsilon.
    pub floored_fraction: f64,
}

impl LossReport {
    fn from_breakdown<B: Backend>(breakdown: &LossBreakdown<B>) -> Self {
        Self {
            loss: scalar(&breakdown.total),
            similarity_loss: scalar(&breakdown.similarity_loss),
            smoothness_loss: scalar(&breakdown.smoothness),
            floored_fraction: breakdown.floored_fraction,
        }
    }

    pub fn ncc(&self) -> f64 {
        -self.similarity_loss
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

/// Summary of a displacement field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldStatistics {
    /// Mean displacement per spatial axis.
    pub mean: Vec<f64>,
    pub min: f64,
    pub max: f64,
    /// Mean Euclidean norm of the displacement vectors.
    pub mean_magnitude: f64,
}

impl FieldStatistics {
    pub fn from_field<B: Backend, const D: usize>(field: &Tensor<B, D>) -> Self {
        let rank = field.dims()[1];
        let mean = (0..rank)
            .map(|axis| scalar(&field.clone().narrow(1, axis, 1).mean()))
            .collect();
        let magnitude = field.clone().powf_scalar(2.0).sum_dim(1).sqrt().mean();
        Self {
            mean,
            min: scalar(&field.clone().min()),
            max: scalar(&field.clone().max()),
            mean_magnitude: scalar(&magnitude),
        }
    }
}

/// Inference result: warped moving image and the raw coarse field.
#[derive(Debug, Clone)]
pub struct Registration<B: Backend, const D: usize> {
    pub warped: Tensor<B, D>,
    pub field: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Registration<B, D> {
    pub fn statistics(&self) -> FieldStatistics {
        FieldStatistics::from_field(&self.field)
    }
}

type PredictorOptimizer<B> = OptimizerAdaptor<Adam, FieldPredictor<B>, B>;

/// Registration engine owning the predictor and, in train mode, its
/// optimizer.
pub struct RegistrationModel<B: AutodiffBackend> {
    predictor: FieldPredictor<B>,
    optimizer: Option<PredictorOptimizer<B>>,
    resampler: SpatialResampler,
    loss: RegistrationLoss,
    config: RegistrationConfig,
    context: ExecutionContext<B>,
    mode: Mode,
    steps: usize,
    warned_degenerate_norm: bool,
}

impl<B: AutodiffBackend> RegistrationModel<B> {
    /// Validate the configuration and allocate the predictor on the
    /// context's device.
    pub fn new(config: RegistrationConfig, mode: Mode, context: ExecutionContext<B>) -> dirnet_core::Result<Self> {
        config.validate()?;
        let predictor = config.predictor.init(context.device())?;
        let optimizer = match mode {
            Mode::Train => Some(config.optimizer()),
            Mode::Infer => None,
        };
        tracing::info!(
            "Registration model in {:?} mode for {:?}, field {:?}, seed {}",
            mode,
            config.predictor.geometry.extents(),
            config.predictor.field_geometry().extents(),
            context
                .seed()
                .map(|seed| seed.to_string())
                .unwrap_or_else(|| "unset".to_string())
        );

        Ok(Self {
            predictor,
            optimizer,
            resampler: config.resampler.init(),
            loss: config.loss.init()?,
            config,
            context,
            mode,
            steps: 0,
            warned_degenerate_norm: false,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn predictor(&self) -> &FieldPredictor<B> {
        &self.predictor
    }

    pub fn context(&self) -> &ExecutionContext<B> {
        &self.context
    }

    pub fn device(&self) -> &B::Device {
        self.context.device()
    }

    /// Optimization steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// One optimization step on a (moving, fixed) batch.
    ///
    /// # Errors
    /// * `InvalidMode` for a model built in infer mode
    /// * `ShapeMismatch` / `DimensionMismatch` for malformed batches
    pub fn fit<const D: usize>(&mut self, moving: Tensor<B, D>, fixed: Tensor<B, D>) -> dirnet_core::Result<LossReport> {
        if self.mode != Mode::Train {
            return Err(RegistrationError::invalid_mode("fit requires a model built in train mode"));
        }
        check_pair(&moving, &fixed)?;
        self.warn_degenerate_norm(moving.dims()[0]);

        let (_, breakdown) = forward_pair(&self.predictor, &self.resampler, &self.loss, moving, fixed)?;
        let report = LossReport::from_breakdown(&breakdown);

        let grads = breakdown.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.predictor);
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| RegistrationError::invalid_mode("optimizer missing in train mode"))?;
        self.predictor = optimizer.step(self.config.learning_rate, self.predictor.clone(), grads);
        self.steps += 1;

        tracing::debug!(
            "Step {}: loss {:.6}, ncc {:.6}, smoothness {:.6}",
            self.steps,
            report.loss,
            report.ncc(),
            report.smoothness_loss
        );
        Ok(report)
    }

    /// Objective on a batch without updating parameters, using running
    /// normalization statistics. Requested diagnostics are written before
    /// returning.
    pub fn evaluate<const D: usize>(
        &self,
        moving: Tensor<B, D>,
        fixed: Tensor<B, D>,
        export: &ExportOptions,
    ) -> dirnet_core::Result<LossReport> {
        check_pair(&moving, &fixed)?;
        let predictor = self.predictor.valid();
        let moving = moving.inner();
        let fixed = fixed.inner();

        let (registration, breakdown) =
            forward_pair(&predictor, &self.resampler, &self.loss, moving.clone(), fixed.clone())?;
        let report = LossReport::from_breakdown(&breakdown);

        if export.is_enabled() {
            export_diagnostics(export, moving, fixed, registration.warped, registration.field)
                .map_err(|e| RegistrationError::export(format!("{:#}", e)))?;
        }
        Ok(report)
    }

    /// Predict the field for a batch and warp the moving image with it.
    pub fn register<const D: usize>(
        &self,
        moving: Tensor<B, D>,
        fixed: Tensor<B, D>,
    ) -> dirnet_core::Result<Registration<B::InnerBackend, D>> {
        check_pair(&moving, &fixed)?;
        let predictor = self.predictor.valid();
        let moving = moving.inner();
        let input = Tensor::cat(vec![moving.clone(), fixed.inner()], 1);
        let field = predictor.forward(input)?;
        let warped = self.resampler.warp(moving, field.clone())?;
        Ok(Registration { warped, field })
    }

    /// Checkpoint the predictor parameters.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> dirnet_core::Result<()> {
        checkpoint::save(&self.predictor, path.as_ref())
    }

    /// Restore predictor parameters saved by [`RegistrationModel::save`].
    ///
    /// In train mode the optimizer state restarts.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> dirnet_core::Result<()> {
        let predictor = checkpoint::load(self.predictor.clone(), path.as_ref(), self.context.device())?;
        self.predictor = predictor;
        if self.mode == Mode::Train {
            self.optimizer = Some(self.config.optimizer());
        }
        Ok(())
    }

    /// Release the model and flush its device.
    pub fn dispose(self) {
        tracing::debug!("Disposing registration model after {} steps", self.steps);
        self.context.dispose();
    }

    fn warn_degenerate_norm(&mut self, batch: usize) {
        let bottleneck = self.config.predictor.field_geometry().num_elements();
        if self.config.predictor.batch_norm && batch * bottleneck == 1 && !self.warned_degenerate_norm {
            tracing::warn!(
                "Batch normalization sees a single value per channel at the bottleneck; \
                 use larger batches or disable batch_norm"
            );
            self.warned_degenerate_norm = true;
        }
    }
}

fn check_pair<B: Backend, const D: usize>(moving: &Tensor<B, D>, fixed: &Tensor<B, D>) -> dirnet_core::Result<()> {
    let (moving, fixed) = (moving.dims(), fixed.dims());
    if moving != fixed {
        return Err(RegistrationError::shape_mismatch(&fixed, &moving));
    }
    Ok(())
}

fn forward_pair<B: Backend, const D: usize>(
    predictor: &FieldPredictor<B>,
    resampler: &SpatialResampler,
    loss: &RegistrationLoss,
    moving: Tensor<B, D>,
    fixed: Tensor<B, D>,
) -> dirnet_core::Result<(Registration<B, D>, LossBreakdown<B>)> {
    let input = Tensor::cat(vec![moving.clone(), fixed.clone()], 1);
    let field = predictor.forward(input)?;
    let warped = resampler.warp(moving, field.clone())?;
    let breakdown = loss.forward(warped.clone(), fixed, field.clone())?;
    Ok((Registration { warped, field }, breakdown))
}
