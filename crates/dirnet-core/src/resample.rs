//! Dense displacement-field warping.
//!
//! `warp(image, field)` resizes the field to the image's spatial extents,
//! adds it to the identity sampling grid, and blends the `2^rank` lattice
//! neighbours of every sample position with multilinear weights. Neighbour
//! indices are clamped per axis, so samples outside the image read the
//! nearest border voxel. Every step is tensor arithmetic or `gather`, so
//! gradients reach both the image and the field.

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::error::RegistrationError;
use crate::geometry::{check_tensor_rank, spatial_dims, validate_extents};
use crate::grid::{to_index_space, DisplacementUnits, SamplingGrid};
use crate::interpolation::InterpolationKernel;

#[derive(Config, Debug)]
pub struct SpatialResamplerConfig {
    /// Unit of the displacement values.
    #[config(default = "DisplacementUnits::Voxel")]
    pub units: DisplacementUnits,
    /// Kernel used to bring a coarse field to image resolution.
    #[config(default = "InterpolationKernel::Cubic")]
    pub field_kernel: InterpolationKernel,
}

impl SpatialResamplerConfig {
    pub fn init(&self) -> SpatialResampler {
        SpatialResampler {
            units: self.units,
            field_kernel: self.field_kernel,
        }
    }
}

/// Parameter-free spatial transformer for rank-4 and rank-5 tensors.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialResampler {
    units: DisplacementUnits,
    field_kernel: InterpolationKernel,
}

impl SpatialResampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> DisplacementUnits {
        self.units
    }

    pub fn field_kernel(&self) -> InterpolationKernel {
        self.field_kernel
    }

    /// Resize `field` to `extents` with the configured kernel.
    pub fn upsample_field<B: Backend, const D: usize>(
        &self,
        field: Tensor<B, D>,
        extents: &[usize],
    ) -> crate::error::Result<Tensor<B, D>> {
        self.field_kernel.resize(field, extents)
    }

    /// Warp `image` (`[batch, channels, *spatial]`) through `field`
    /// (`[batch, rank, *coarse]`).
    ///
    /// The result always has the image's shape, whatever the field's
    /// resolution.
    ///
    /// # Errors
    /// * `DimensionMismatch` for tensor ranks other than 4 and 5
    /// * `ShapeMismatch` if batch sizes differ or the field does not carry
    ///   one channel per spatial axis
    /// * `DegenerateGeometry` if any spatial extent is zero
    pub fn warp<B: Backend, const D: usize>(
        &self,
        image: Tensor<B, D>,
        field: Tensor<B, D>,
    ) -> crate::error::Result<Tensor<B, D>> {
        check_tensor_rank(D)?;
        let image_dims = image.dims();
        let field_dims = field.dims();
        let rank = D - 2;

        if field_dims[0] != image_dims[0] || field_dims[1] != rank {
            let mut expected = field_dims.to_vec();
            expected[0] = image_dims[0];
            expected[1] = rank;
            return Err(RegistrationError::shape_mismatch(&expected, &field_dims));
        }
        let extents = spatial_dims(&image_dims).to_vec();
        validate_extents(&extents)?;
        validate_extents(spatial_dims(&field_dims))?;

        let field = self.upsample_field(field, &extents)?;
        let grid = SamplingGrid::<B, D>::identity(&extents, &image.device())?;
        let positions = grid
            .displace(field, self.units)
            .into_iter()
            .zip(&extents)
            .map(|(coords, &n)| to_index_space(coords, n))
            .collect();

        Ok(blend_neighbours(image, positions))
    }
}

/// Lower/upper lattice neighbour of every sample along one axis, already
/// multiplied by the axis stride, with their blend weights.
struct AxisNeighbours<B: Backend, const D: usize> {
    lower: Tensor<B, D, Int>,
    upper: Tensor<B, D, Int>,
    lower_weight: Tensor<B, D>,
    upper_weight: Tensor<B, D>,
}

impl<B: Backend, const D: usize> AxisNeighbours<B, D> {
    fn new(position: Tensor<B, D>, extent: usize, stride: usize) -> Self {
        let max = (extent - 1) as f32;
        let base = position.clone().floor();
        let upper_weight = position - base.clone();
        let lower_weight = upper_weight.clone().neg().add_scalar(1.0);

        let lower = base.clone().clamp(0.0, max).int().mul_scalar(stride as i32);
        let upper = base.add_scalar(1.0).clamp(0.0, max).int().mul_scalar(stride as i32);

        Self {
            lower,
            upper,
            lower_weight,
            upper_weight,
        }
    }
}

/// Multilinear gather-and-blend of `image` at continuous `positions`, one
/// `[batch, 1, *spatial]` index-space tensor per axis.
fn blend_neighbours<B: Backend, const D: usize>(
    image: Tensor<B, D>,
    positions: Vec<Tensor<B, D>>,
) -> Tensor<B, D> {
    let dims = image.dims();
    let (batch, channels) = (dims[0], dims[1]);
    let extents = spatial_dims(&dims);
    let total: usize = extents.iter().product();

    let mut strides = vec![1usize; extents.len()];
    for axis in (0..extents.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * extents[axis + 1];
    }

    let neighbours: Vec<AxisNeighbours<B, D>> = positions
        .into_iter()
        .zip(extents.iter().zip(&strides))
        .map(|(position, (&extent, &stride))| AxisNeighbours::new(position, extent, stride))
        .collect();

    let flat_image = image.reshape([batch, channels, total]);
    let mut blended: Option<Tensor<B, D>> = None;

    for corner in 0..(1usize << neighbours.len()) {
        let mut index: Option<Tensor<B, D, Int>> = None;
        let mut weight: Option<Tensor<B, D>> = None;
        for (axis, axis_neighbours) in neighbours.iter().enumerate() {
            let (axis_index, axis_weight) = if corner & (1 << axis) == 0 {
                (&axis_neighbours.lower, &axis_neighbours.lower_weight)
            } else {
                (&axis_neighbours.upper, &axis_neighbours.upper_weight)
            };
            index = Some(match index {
                Some(acc) => acc + axis_index.clone(),
                None => axis_index.clone(),
            });
            weight = Some(match weight {
                Some(acc) => acc * axis_weight.clone(),
                None => axis_weight.clone(),
            });
        }
        let (Some(index), Some(weight)) = (index, weight) else {
            continue;
        };

        let index = index.reshape([batch, 1, total]).repeat(&[1, channels, 1]);
        let values: Tensor<B, D> = flat_image.clone().gather(2, index).reshape(dims);
        let term = values * weight;
        blended = Some(match blended {
            Some(acc) => acc + term,
            None => term,
        });
    }

    blended.unwrap_or_else(|| flat_image.reshape(dims))
}
