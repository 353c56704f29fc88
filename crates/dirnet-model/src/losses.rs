//! Registration objective: normalized cross-correlation similarity plus a
//! finite-difference smoothness penalty on the displacement field.
//!
//! `loss = -NCC(warped, fixed) + lambda * smoothness(field)`

use burn::prelude::*;
use burn::tensor::ElementConversion;
use dirnet_core::geometry::{check_tensor_rank, spatial_dims};
use dirnet_core::RegistrationError;
use serde::{Deserialize, Serialize};

/// Fraction of floored voxels above which NCC instability is logged as a
/// warning rather than at debug level.
const FLAT_WARNING_FRACTION: f64 = 0.5;

/// Support of the NCC statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimilarityKind {
    /// Box-window local statistics around every voxel.
    #[default]
    Local,
    /// One set of statistics per sample and channel.
    Global,
}

/// How squared field differences are reduced per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SmoothnessReduction {
    /// Mean over locations and channels, summed over axes.
    #[default]
    Mean,
    /// Plain sum, which grows with resolution.
    Sum,
}

/// NCC value together with the share of statistics floored by epsilon.
#[derive(Debug, Clone)]
pub struct SimilarityScore<B: Backend> {
    /// Mean correlation in `[-1, 1]` over non-flat statistics.
    pub ncc: Tensor<B, 1>,
    /// Fraction of voxels (or samples for global NCC) whose variance was
    /// floored.
    pub floored_fraction: f64,
}

fn check_same_shape(warped: &[usize], fixed: &[usize]) -> dirnet_core::Result<()> {
    if warped != fixed {
        return Err(RegistrationError::shape_mismatch(fixed, warped));
    }
    Ok(())
}

fn report_flat_fraction(kind: &str, fraction: f64) {
    if fraction > FLAT_WARNING_FRACTION {
        tracing::warn!(
            "{} NCC: {:.1}% of statistics are flat and were floored by epsilon",
            kind,
            fraction * 100.0
        );
    } else if fraction > 0.0 {
        tracing::debug!("{} NCC: {:.3}% floored statistics", kind, fraction * 100.0);
    }
}

/// Mean correlation over the statistics whose variances both reach
/// `epsilon`, and the fraction that did not.
///
/// Flat statistics carry no correlation information and are left out of the
/// mean, so identical images score 1 however much flat background they
/// contain. With no informative statistics at all the score is 0.
fn masked_correlation<B: Backend, const D: usize>(
    cov: Tensor<B, D>,
    var_a: Tensor<B, D>,
    var_b: Tensor<B, D>,
    epsilon: f64,
) -> (Tensor<B, 1>, f64) {
    let informative = var_a
        .clone()
        .min_pair(var_b.clone())
        .greater_equal_elem(epsilon)
        .float();
    let total = informative.shape().num_elements().max(1) as f64;
    let count = informative.clone().sum();
    let floored_fraction = 1.0 - count.clone().into_scalar().elem::<f64>() / total;

    let denom = (var_a.clamp_min(epsilon) * var_b.clamp_min(epsilon)).sqrt();
    let correlation = (cov / denom).clamp(-1.0, 1.0) * informative;
    let ncc = correlation.sum() / count.clamp_min(1.0);
    (ncc, floored_fraction)
}

/// Locally windowed normalized cross-correlation.
#[derive(Debug, Clone)]
pub struct LocalNcc {
    window: usize,
    epsilon: f64,
}

impl LocalNcc {
    pub fn new(window: usize, epsilon: f64) -> Self {
        Self { window, epsilon }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Mean local NCC between two equally shaped `[batch, channels,
    /// *spatial]` tensors.
    pub fn forward<B: Backend, const D: usize>(
        &self,
        warped: Tensor<B, D>,
        fixed: Tensor<B, D>,
    ) -> dirnet_core::Result<SimilarityScore<B>> {
        check_tensor_rank(D)?;
        check_same_shape(&warped.dims(), &fixed.dims())?;

        let mean_f = self.box_mean(fixed.clone());
        let mean_w = self.box_mean(warped.clone());
        let mean_ff = self.box_mean(fixed.clone() * fixed.clone());
        let mean_ww = self.box_mean(warped.clone() * warped.clone());
        let mean_fw = self.box_mean(fixed * warped);

        let var_f = mean_ff - mean_f.clone() * mean_f.clone();
        let var_w = mean_ww - mean_w.clone() * mean_w.clone();
        let cov = mean_fw - mean_f * mean_w;

        let (ncc, floored_fraction) = masked_correlation(cov, var_f, var_w, self.epsilon);
        report_flat_fraction("Local", floored_fraction);

        Ok(SimilarityScore {
            ncc,
            floored_fraction,
        })
    }

    /// Separable box mean with replicated borders.
    fn box_mean<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let radius = self.window / 2;
        let mut x = x;
        if radius == 0 {
            return x;
        }
        for axis in 2..D {
            let n = x.dims()[axis];
            if n == 1 {
                continue;
            }
            let mut reps = [1usize; D];
            reps[axis] = radius;
            let head = x.clone().narrow(axis, 0, 1).repeat(&reps);
            let tail = x.clone().narrow(axis, n - 1, 1).repeat(&reps);
            let padded = Tensor::cat(vec![head, x, tail], axis);

            let mut sum = padded.clone().narrow(axis, 0, n);
            for offset in 1..self.window {
                sum = sum + padded.clone().narrow(axis, offset, n);
            }
            x = sum.div_scalar(self.window as f32);
        }
        x
    }
}

/// Whole-image normalized cross-correlation, per sample and channel.
#[derive(Debug, Clone)]
pub struct GlobalNcc {
    epsilon: f64,
}

impl GlobalNcc {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn forward<B: Backend, const D: usize>(
        &self,
        warped: Tensor<B, D>,
        fixed: Tensor<B, D>,
    ) -> dirnet_core::Result<SimilarityScore<B>> {
        check_tensor_rank(D)?;
        let dims = fixed.dims();
        check_same_shape(&warped.dims(), &dims)?;

        let total: usize = spatial_dims(&dims).iter().product();
        let fixed: Tensor<B, 3> = fixed.reshape([dims[0], dims[1], total]);
        let warped: Tensor<B, 3> = warped.reshape([dims[0], dims[1], total]);

        let fixed = fixed.clone() - fixed.mean_dim(2);
        let warped = warped.clone() - warped.mean_dim(2);

        let var_f = (fixed.clone() * fixed.clone()).mean_dim(2);
        let var_w = (warped.clone() * warped.clone()).mean_dim(2);
        let cov = (fixed * warped).mean_dim(2);

        let (ncc, floored_fraction) = masked_correlation(cov, var_f, var_w, self.epsilon);
        report_flat_fraction("Global", floored_fraction);

        Ok(SimilarityScore {
            ncc,
            floored_fraction,
        })
    }
}

/// Squared forward differences of a displacement field.
#[derive(Debug, Clone, Default)]
pub struct GradientSmoothness {
    reduction: SmoothnessReduction,
}

impl GradientSmoothness {
    pub fn new(reduction: SmoothnessReduction) -> Self {
        Self { reduction }
    }

    /// Non-negative penalty; zero for a constant field. Axes of extent 1
    /// contribute nothing.
    pub fn forward<B: Backend, const D: usize>(&self, field: Tensor<B, D>) -> dirnet_core::Result<Tensor<B, 1>> {
        check_tensor_rank(D)?;
        let dims = field.dims();

        let mut penalty = Tensor::<B, 1>::zeros([1], &field.device());
        for axis in 2..D {
            let n = dims[axis];
            if n < 2 {
                continue;
            }
            let diff = field.clone().narrow(axis, 1, n - 1) - field.clone().narrow(axis, 0, n - 1);
            let squared = diff.powf_scalar(2.0);
            penalty = penalty
                + match self.reduction {
                    SmoothnessReduction::Mean => squared.mean(),
                    SmoothnessReduction::Sum => squared.sum(),
                };
        }
        Ok(penalty)
    }
}

#[derive(Config, Debug)]
pub struct RegistrationLossConfig {
    /// Weight of the smoothness term.
    #[config(default = 1e-3)]
    pub lambda: f64,
    /// Box window extent of the local NCC. Must be odd.
    #[config(default = 9)]
    pub window: usize,
    /// Variance floor of the NCC.
    #[config(default = 1e-5)]
    pub epsilon: f64,
    #[config(default = "SimilarityKind::Local")]
    pub similarity: SimilarityKind,
    #[config(default = "SmoothnessReduction::Mean")]
    pub reduction: SmoothnessReduction,
}

impl RegistrationLossConfig {
    pub fn validate(&self) -> dirnet_core::Result<()> {
        if !(self.lambda.is_finite() && self.lambda >= 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "smoothness weight must be finite and non-negative, got {}",
                self.lambda
            )));
        }
        if self.window == 0 || self.window % 2 == 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "NCC window must be a positive odd extent, got {}",
                self.window
            )));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "NCC epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    pub fn init(&self) -> dirnet_core::Result<RegistrationLoss> {
        self.validate()?;
        let similarity = match self.similarity {
            SimilarityKind::Local => Similarity::Local(LocalNcc::new(self.window, self.epsilon)),
            SimilarityKind::Global => Similarity::Global(GlobalNcc::new(self.epsilon)),
        };
        Ok(RegistrationLoss {
            similarity,
            smoothness: GradientSmoothness::new(self.reduction),
            lambda: self.lambda,
        })
    }
}

#[derive(Debug, Clone)]
enum Similarity {
    Local(LocalNcc),
    Global(GlobalNcc),
}

/// Per-term breakdown of one objective evaluation.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    /// `similarity_loss + lambda * smoothness`.
    pub total: Tensor<B, 1>,
    /// Negated NCC.
    pub similarity_loss: Tensor<B, 1>,
    /// Unweighted smoothness penalty.
    pub smoothness: Tensor<B, 1>,
    pub floored_fraction: f64,
}

/// Composite registration objective.
#[derive(Debug, Clone)]
pub struct RegistrationLoss {
    similarity: Similarity,
    smoothness: GradientSmoothness,
    lambda: f64,
}

impl RegistrationLoss {
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn similarity<B: Backend, const D: usize>(
        &self,
        warped: Tensor<B, D>,
        fixed: Tensor<B, D>,
    ) -> dirnet_core::Result<SimilarityScore<B>> {
        match &self.similarity {
            Similarity::Local(ncc) => ncc.forward(warped, fixed),
            Similarity::Global(ncc) => ncc.forward(warped, fixed),
        }
    }

    pub fn forward<B: Backend, const D: usize>(
        &self,
        warped: Tensor<B, D>,
        fixed: Tensor<B, D>,
        field: Tensor<B, D>,
    ) -> dirnet_core::Result<LossBreakdown<B>> {
        let score = self.similarity(warped, fixed)?;
        let smoothness = self.smoothness.forward(field)?;
        let similarity_loss = score.ncc.neg();
        let total = similarity_loss.clone() + smoothness.clone().mul_scalar(self.lambda);

        Ok(LossBreakdown {
            total,
            similarity_loss,
            smoothness,
            floored_fraction: score.floored_fraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_box_mean_of_constant_is_constant() {
        let device = Default::default();
        let x = Tensor::<B, 5>::ones([1, 1, 4, 5, 3], &device).mul_scalar(2.5);
        let mean = LocalNcc::new(3, 1e-5).box_mean(x);
        for v in mean.into_data().to_vec::<f32>().unwrap() {
            assert!((v - 2.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_box_mean_replicates_border() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([0.0, 3.0, 6.0], &device).reshape([1, 1, 1, 3]);
        let mean = LocalNcc::new(3, 1e-5).box_mean(x);
        let values = mean.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!((values[1] - 3.0).abs() < 1e-6);
        assert!((values[2] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_nonfinite_lambda() {
        let config = RegistrationLossConfig::new().with_lambda(f64::NAN);
        assert!(matches!(config.init(), Err(RegistrationError::InvalidConfiguration(_))));
    }
}
