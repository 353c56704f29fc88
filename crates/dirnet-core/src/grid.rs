//! Normalized identity sampling grids.
//!
//! Coordinates span `[-1, 1]` along every axis with `-1` on the first voxel
//! centre and `1` on the last (corner alignment). An axis of extent 1 carries
//! the single coordinate `0`.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::geometry::{check_tensor_rank, validate_extents};

/// Unit in which displacement field values are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplacementUnits {
    /// Offsets in voxels of the image being warped.
    #[default]
    Voxel,
    /// Offsets in the `[-1, 1]` grid space, added to the grid unchanged.
    Normalized,
}

/// Normalized coordinates of the `n` lattice points of one axis.
pub fn normalized_coordinates(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![0.0; n];
    }
    let step = 2.0 / (n - 1) as f64;
    (0..n).map(|i| (i as f64 * step - 1.0) as f32).collect()
}

/// Factor converting a voxel offset into a normalized offset.
pub fn voxel_to_normalized_scale(n: usize) -> f32 {
    if n <= 1 {
        0.0
    } else {
        2.0 / (n - 1) as f32
    }
}

/// Factor converting `coord + 1` into a continuous index.
pub fn normalized_to_index_scale(n: usize) -> f32 {
    n.saturating_sub(1) as f32 / 2.0
}

/// Identity sampling grid, one broadcastable coordinate tensor per axis.
///
/// Axis `a` is stored with shape `[1, 1, .., n_a, .., 1]` so it broadcasts
/// against `[batch, 1, *extents]` without materializing the full mesh.
#[derive(Debug, Clone)]
pub struct SamplingGrid<B: Backend, const D: usize> {
    axes: Vec<Tensor<B, D>>,
    extents: Vec<usize>,
}

impl<B: Backend, const D: usize> SamplingGrid<B, D> {
    /// Build the identity grid for `extents` on `device`.
    pub fn identity(extents: &[usize], device: &B::Device) -> Result<Self> {
        check_tensor_rank(D)?;
        if extents.len() != D - 2 {
            return Err(RegistrationError::dimension_mismatch(format!(
                "rank-{} grid needs {} spatial extents, got {:?}",
                D,
                D - 2,
                extents
            )));
        }
        validate_extents(extents)?;

        let axes = extents
            .iter()
            .enumerate()
            .map(|(axis, &n)| {
                let coords = normalized_coordinates(n);
                let mut shape = [1usize; D];
                shape[axis + 2] = n;
                Tensor::<B, 1>::from_data(TensorData::new(coords, Shape::new([n])), device).reshape(shape)
            })
            .collect();

        Ok(Self {
            axes,
            extents: extents.to_vec(),
        })
    }

    /// Spatial extents the grid was built for.
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Broadcastable normalized coordinates of one axis.
    pub fn axis(&self, axis: usize) -> Tensor<B, D> {
        self.axes[axis].clone()
    }

    /// Absolute normalized sample coordinates `grid + field`, one tensor of
    /// shape `[batch, 1, *extents]` per axis.
    ///
    /// `field` must already have this grid's spatial extents and one channel
    /// per axis.
    pub fn displace(&self, field: Tensor<B, D>, units: DisplacementUnits) -> Vec<Tensor<B, D>> {
        self.axes
            .iter()
            .zip(&self.extents)
            .enumerate()
            .map(|(axis, (coords, &n))| {
                let offset = field.clone().narrow(1, axis, 1);
                let offset = match units {
                    DisplacementUnits::Voxel => offset.mul_scalar(voxel_to_normalized_scale(n)),
                    DisplacementUnits::Normalized => offset,
                };
                offset + coords.clone()
            })
            .collect()
    }
}

/// Map normalized coordinates of an axis with extent `n` to continuous
/// indices: `idx = (coord + 1) * (n - 1) / 2`.
pub fn to_index_space<B: Backend, const D: usize>(coords: Tensor<B, D>, n: usize) -> Tensor<B, D> {
    coords.add_scalar(1.0).mul_scalar(normalized_to_index_scale(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_normalized_coordinates_span() {
        let coords = normalized_coordinates(5);
        assert_eq!(coords, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(normalized_coordinates(1), vec![0.0]);
    }

    #[test]
    fn test_identity_maps_to_lattice() {
        let device = Default::default();
        let grid = SamplingGrid::<B, 4>::identity(&[3, 7], &device).unwrap();
        let idx = to_index_space(grid.axis(1), 7);
        let values = idx.into_data().to_vec::<f32>().unwrap();
        for (i, v) in values.iter().enumerate() {
            assert!((v - i as f32).abs() < 1e-5, "index {} mapped to {}", i, v);
        }
    }

    #[test]
    fn test_unit_extent_is_fixed_coordinate() {
        let device = Default::default();
        let grid = SamplingGrid::<B, 5>::identity(&[1, 4, 4], &device).unwrap();
        let field = Tensor::<B, 5>::ones([2, 3, 1, 4, 4], &device);
        let coords = grid.displace(field, DisplacementUnits::Voxel);
        let depth = to_index_space(coords[0].clone(), 1);
        let values = depth.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rejects_wrong_extent_count() {
        let device = Default::default();
        let err = SamplingGrid::<B, 5>::identity(&[4, 4], &device).unwrap_err();
        assert!(matches!(err, RegistrationError::DimensionMismatch(_)));
    }
}
