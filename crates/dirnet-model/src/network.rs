//! Displacement-field predictor.
//!
//! Seven convolution blocks over the channel-concatenated (moving, fixed)
//! pair. Blocks 1-4 use `k×k×k` kernels and are each followed by 2× average
//! pooling with "same" padding; blocks 5-6 are pointwise; block 7 is a
//! pointwise projection to one channel per spatial axis with no
//! normalization and no activation.
//!
//! ```text
//! [B, 2C, D, H, W]
//!   └─ conv-bn-elu, pool ×4   → [B, F, D/16, H/16, W/16]
//!   └─ conv1-bn-elu ×2        → [B, F, D/16, H/16, W/16]
//!   └─ conv1                  → [B, 3, D/16, H/16, W/16]
//! ```
//!
//! Planar inputs run through the same network as depth-1 volumes with
//! `1×k×k` kernels.

use burn::{
    module::{Ignored, Module, ParamId},
    nn::{
        conv::{Conv3d, Conv3dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig3d,
    },
    prelude::*,
};
use dirnet_core::geometry::check_tensor_rank;
use dirnet_core::{RegistrationError, VolumeGeometry};

/// Number of 2× pooling stages between input and field resolution.
pub const POOLING_STAGES: usize = 4;

const HIDDEN_BLOCKS: usize = 6;

#[derive(Config, Debug)]
pub struct FieldPredictorConfig {
    /// Spatial extents of the moving and fixed images.
    pub geometry: VolumeGeometry,
    /// Channels of each input image; the network sees twice this many.
    #[config(default = 1)]
    pub in_channels: usize,
    /// Feature channels of the hidden blocks.
    #[config(default = 16)]
    pub channels: usize,
    /// Kernel extent of blocks 1-4. Must be odd.
    #[config(default = 3)]
    pub kernel_size: usize,
    /// Batch normalization after hidden convolutions.
    ///
    /// Running statistics use momentum 0.1, the weight of each new batch
    /// statistic. This is the same update as a moving-average decay of 0.9,
    /// the convention where the weight is on the old value.
    #[config(default = true)]
    pub batch_norm: bool,
    /// Standard deviation of the normal weight initializer.
    #[config(default = 0.01)]
    pub init_std: f64,
}

impl FieldPredictorConfig {
    /// Check the constructor invariants.
    pub fn validate(&self) -> dirnet_core::Result<()> {
        self.geometry.validate()?;
        if self.in_channels == 0 || self.channels == 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "channel counts must be positive (in_channels={}, channels={})",
                self.in_channels, self.channels
            )));
        }
        if self.kernel_size % 2 == 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "kernel size must be odd, got {}",
                self.kernel_size
            )));
        }
        if !(self.init_std.is_finite() && self.init_std > 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "init_std must be positive and finite, got {}",
                self.init_std
            )));
        }
        Ok(())
    }

    /// Channels of the concatenated network input.
    pub fn input_channels(&self) -> usize {
        2 * self.in_channels
    }

    /// Spatial geometry of the predicted field.
    pub fn field_geometry(&self) -> VolumeGeometry {
        self.geometry.pooled(POOLING_STAGES)
    }

    /// Allocate the parameter set once.
    pub fn init<B: Backend>(&self, device: &B::Device) -> dirnet_core::Result<FieldPredictor<B>> {
        self.validate()?;

        let k = self.kernel_size;
        let p = k / 2;
        let (kernel, padding) = match self.geometry.rank() {
            2 => ([1, k, k], PaddingConfig3d::Explicit(0, p, p)),
            _ => ([k, k, k], PaddingConfig3d::Explicit(p, p, p)),
        };
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std,
        };

        let blocks = (0..HIDDEN_BLOCKS)
            .map(|i| {
                let in_channels = if i == 0 { self.input_channels() } else { self.channels };
                let conv = if i < POOLING_STAGES {
                    Conv3dConfig::new([in_channels, self.channels], kernel)
                        .with_padding(padding.clone())
                } else {
                    Conv3dConfig::new([in_channels, self.channels], [1, 1, 1])
                };
                let conv = conv
                    .with_bias(!self.batch_norm)
                    .with_initializer(initializer.clone())
                    .init(device);
                let norm = self.batch_norm.then(|| {
                    BatchNormConfig::new(self.channels)
                        // new = 0.9 * running + 0.1 * batch
                        .with_momentum(0.1)
                        .with_epsilon(1e-5)
                        .init(device)
                });
                ConvBlock { conv, norm }
            })
            .collect();

        let head = Conv3dConfig::new([self.channels, self.geometry.rank()], [1, 1, 1])
            .with_initializer(initializer)
            .init(device);

        tracing::debug!(
            "Initialized field predictor for {:?} ({} -> {} channels)",
            self.geometry.extents(),
            self.input_channels(),
            self.geometry.rank()
        );

        Ok(FieldPredictor {
            blocks,
            head,
            config: Ignored(self.clone()),
        })
    }
}

/// Convolution, optional batch normalization and ELU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv3d<B>,
    pub norm: Option<BatchNorm<B, 3>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        elu(x)
    }
}

#[derive(Module, Debug)]
pub struct FieldPredictor<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
    pub head: Conv3d<B>,
    config: Ignored<FieldPredictorConfig>,
}

impl<B: Backend> FieldPredictor<B> {
    pub fn config(&self) -> &FieldPredictorConfig {
        &self.config.0
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.config.0.geometry
    }

    pub fn field_geometry(&self) -> VolumeGeometry {
        self.config.0.field_geometry()
    }

    /// Predict the coarse displacement field for a concatenated
    /// `[batch, 2 * in_channels, *spatial]` pair.
    ///
    /// Only reads parameters; repeated calls share one parameter set.
    ///
    /// # Errors
    /// * `DimensionMismatch` if `D` is not the tensor rank of the geometry
    /// * `ShapeMismatch` if channels or spatial extents differ from the
    ///   configuration
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> dirnet_core::Result<Tensor<B, D>> {
        check_tensor_rank(D)?;
        let geometry = self.geometry();
        if D != geometry.tensor_rank() {
            return Err(RegistrationError::dimension_mismatch(format!(
                "predictor configured for rank-{} input, got rank {}",
                geometry.tensor_rank(),
                D
            )));
        }
        let dims = input.dims();
        geometry.check_dims(&dims, self.config.0.input_channels())?;

        let batch = dims[0];
        let x: Tensor<B, 5> = input.reshape(volume_shape(&dims));
        let x = self.forward_volume(x);

        let field_dims = self.field_geometry().tensor_dims(batch, geometry.rank());
        let mut shape = [0usize; D];
        shape.copy_from_slice(&field_dims);
        Ok(x.reshape(shape))
    }

    fn forward_volume(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = x;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if i < POOLING_STAGES {
                x = avg_pool_same(x);
            }
        }
        self.head.forward(x)
    }

    /// Name and shape of every persisted tensor, in record order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let prefix = format!("blocks.{}", i);
            shapes.push((format!("{}.conv.weight", prefix), block.conv.weight.val().dims().to_vec()));
            if let Some(bias) = &block.conv.bias {
                shapes.push((format!("{}.conv.bias", prefix), bias.val().dims().to_vec()));
            }
            if let Some(norm) = &block.norm {
                shapes.push((format!("{}.norm.gamma", prefix), norm.gamma.val().dims().to_vec()));
                shapes.push((format!("{}.norm.beta", prefix), norm.beta.val().dims().to_vec()));
                shapes.push((
                    format!("{}.norm.running_mean", prefix),
                    norm.running_mean.value().dims().to_vec(),
                ));
                shapes.push((
                    format!("{}.norm.running_var", prefix),
                    norm.running_var.value().dims().to_vec(),
                ));
            }
        }
        shapes.push(("head.weight".to_string(), self.head.weight.val().dims().to_vec()));
        if let Some(bias) = &self.head.bias {
            shapes.push(("head.bias".to_string(), bias.val().dims().to_vec()));
        }
        shapes
    }

    /// Identifiers of the learnable parameters.
    pub fn parameter_ids(&self) -> Vec<ParamId> {
        let mut ids = Vec::new();
        for block in &self.blocks {
            ids.push(block.conv.weight.id);
            if let Some(bias) = &block.conv.bias {
                ids.push(bias.id);
            }
            if let Some(norm) = &block.norm {
                ids.push(norm.gamma.id);
                ids.push(norm.beta.id);
            }
        }
        ids.push(self.head.weight.id);
        if let Some(bias) = &self.head.bias {
            ids.push(bias.id);
        }
        ids
    }
}

/// `[b, c, *spatial]` as a rank-5 shape, planar inputs getting depth 1.
fn volume_shape(dims: &[usize]) -> [usize; 5] {
    let mut shape = [1usize; 5];
    shape[0] = dims[0];
    shape[1] = dims[1];
    let spatial = &dims[2..];
    shape[5 - spatial.len()..].copy_from_slice(spatial);
    shape
}

/// Exponential linear unit with unit scale.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.clamp_max(0.0).exp().sub_scalar(1.0)
}

/// 2× average pooling along every spatial axis, rounding extents up.
///
/// An odd trailing voxel is averaged with itself, matching "same" padding
/// that excludes the pad from the count. Extent-1 axes are left alone.
pub fn avg_pool_same<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 5> {
    let mut x = x;
    for axis in 2..5 {
        x = avg_pool_axis(x, axis);
    }
    x
}

fn avg_pool_axis<B: Backend>(x: Tensor<B, 5>, axis: usize) -> Tensor<B, 5> {
    let dims = x.dims();
    let n = dims[axis];
    if n <= 1 {
        return x;
    }
    let x = if n % 2 == 1 {
        let last = x.clone().narrow(axis, n - 1, 1);
        Tensor::cat(vec![x, last], axis)
    } else {
        x
    };
    let half = n.div_ceil(2);
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();

    let mut pooled = dims;
    pooled[axis] = half;
    x.reshape([outer, half, 2, inner]).mean_dim(2).reshape(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_elu() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([-1.0, 0.0, 2.0], &device);
        let y = elu(x).into_data().to_vec::<f32>().unwrap();
        assert!((y[0] - ((-1.0f32).exp() - 1.0)).abs() < 1e-6);
        assert_eq!(y[1], 0.0);
        assert_eq!(y[2], 2.0);
    }

    #[test]
    fn test_pool_odd_extent_replicates_last() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([1.0, 3.0, 5.0, 7.0, 9.0], &device).reshape([1, 1, 1, 1, 5]);
        let y = avg_pool_same(x);
        assert_eq!(y.dims(), [1, 1, 1, 1, 3]);
        assert_eq!(y.into_data().to_vec::<f32>().unwrap(), vec![2.0, 6.0, 9.0]);
    }

    #[test]
    fn test_volume_shape_for_planar_input() {
        assert_eq!(volume_shape(&[2, 4, 16, 8]), [2, 4, 1, 16, 8]);
        assert_eq!(volume_shape(&[2, 4, 3, 16, 8]), [2, 4, 3, 16, 8]);
    }

    #[test]
    fn test_rejects_even_kernel() {
        let geometry = VolumeGeometry::new(vec![8, 8, 8]).unwrap();
        let config = FieldPredictorConfig::new(geometry).with_kernel_size(4);
        assert!(matches!(
            config.validate(),
            Err(RegistrationError::InvalidConfiguration(_))
        ));
    }
}
