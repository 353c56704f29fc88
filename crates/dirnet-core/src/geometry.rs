//! Validated spatial geometry of volumes and displacement fields.
//!
//! Tensors follow the channels-first layout `[batch, channels, *spatial]`,
//! so a rank-4 tensor carries a planar image and a rank-5 tensor a volume.

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};

/// Spatial extents of a volume (`[depth, height, width]`) or a plane
/// (`[height, width]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    extents: Vec<usize>,
}

impl VolumeGeometry {
    /// Create a validated geometry.
    ///
    /// # Errors
    /// * `InvalidConfiguration` if the rank is not 2 or 3
    /// * `DegenerateGeometry` if any extent is zero
    pub fn new(extents: impl Into<Vec<usize>>) -> Result<Self> {
        let geometry = Self {
            extents: extents.into(),
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Re-check the invariants, e.g. after deserialization.
    pub fn validate(&self) -> Result<()> {
        let rank = self.extents.len();
        if rank != 2 && rank != 3 {
            return Err(RegistrationError::invalid_configuration(format!(
                "spatial rank must be 2 or 3, got {} ({:?})",
                rank, self.extents
            )));
        }
        validate_extents(&self.extents)
    }

    /// Number of spatial axes.
    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    /// Extent along every spatial axis.
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Total number of voxels (pixels in 2D).
    pub fn num_elements(&self) -> usize {
        self.extents.iter().product()
    }

    /// Tensor rank of a batch with this geometry.
    pub fn tensor_rank(&self) -> usize {
        self.rank() + 2
    }

    /// Geometry after `stages` rounds of 2× pooling with "same" padding.
    pub fn pooled(&self, stages: usize) -> Self {
        let extents = self
            .extents
            .iter()
            .map(|&n| (0..stages).fold(n, |n, _| n.div_ceil(2)))
            .collect();
        Self { extents }
    }

    /// Full tensor dimensions for a given batch size and channel count.
    pub fn tensor_dims(&self, batch: usize, channels: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.tensor_rank());
        dims.push(batch);
        dims.push(channels);
        dims.extend_from_slice(&self.extents);
        dims
    }

    /// Check that `dims` describes a batch with this geometry and `channels`
    /// channels. The batch size is free.
    pub fn check_dims(&self, dims: &[usize], channels: usize) -> Result<()> {
        let expected = self.tensor_dims(dims.first().copied().unwrap_or(0), channels);
        if dims != expected.as_slice() {
            return Err(RegistrationError::shape_mismatch(&expected, dims));
        }
        Ok(())
    }
}

/// Reject tensor ranks other than 4 (planar) and 5 (volumetric).
pub fn check_tensor_rank(rank: usize) -> Result<()> {
    if rank != 4 && rank != 5 {
        return Err(RegistrationError::dimension_mismatch(format!(
            "expected a rank-4 [B, C, H, W] or rank-5 [B, C, D, H, W] tensor, got rank {}",
            rank
        )));
    }
    Ok(())
}

/// Reject zero extents; extent-1 axes are valid fixed coordinates.
pub fn validate_extents(extents: &[usize]) -> Result<()> {
    if let Some(axis) = extents.iter().position(|&n| n == 0) {
        return Err(RegistrationError::degenerate_geometry(format!(
            "spatial axis {} has zero extent in {:?}",
            axis, extents
        )));
    }
    Ok(())
}

/// Spatial part of a channels-first tensor shape.
pub fn spatial_dims(dims: &[usize]) -> &[usize] {
    &dims[2.min(dims.len())..]
}
