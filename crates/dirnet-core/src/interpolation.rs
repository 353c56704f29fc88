//! Separable field resizing.
//!
//! Resizing runs axis by axis: for every output position along an axis the
//! kernel blends a fixed number of source taps gathered with `select`, with
//! tap indices clamped to the axis so border values are replicated. Output
//! index `j` maps to source coordinate `j * (n_in - 1) / (n_out - 1)`, which
//! puts the first and last samples of both lattices on top of each other.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Shape, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::geometry::{check_tensor_rank, spatial_dims, validate_extents};

/// Keys' cubic convolution parameter.
const CUBIC_A: f64 = -0.5;

/// Interpolation kernel used to resize displacement fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterpolationKernel {
    /// Two-tap linear kernel (bilinear / trilinear).
    Linear,
    /// Four-tap cubic convolution kernel (bicubic / tricubic), C1-continuous.
    #[default]
    Cubic,
}

impl InterpolationKernel {
    /// Offsets of the taps relative to `floor(src)`.
    fn offsets(&self) -> &'static [i64] {
        match self {
            Self::Linear => &[0, 1],
            Self::Cubic => &[-1, 0, 1, 2],
        }
    }

    /// Kernel weight for a tap at signed distance `x` from the sample.
    pub fn weight(&self, x: f64) -> f64 {
        let x = x.abs();
        match self {
            Self::Linear => (1.0 - x).max(0.0),
            Self::Cubic => {
                if x <= 1.0 {
                    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
                } else if x < 2.0 {
                    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
                } else {
                    0.0
                }
            }
        }
    }

    /// Resize the spatial axes of a `[batch, channels, *spatial]` tensor to
    /// `extents`, keeping batch and channel dimensions.
    ///
    /// Axes whose extent already matches are left untouched, so resizing to
    /// the current shape returns the input exactly.
    pub fn resize<B: Backend, const D: usize>(
        &self,
        tensor: Tensor<B, D>,
        extents: &[usize],
    ) -> Result<Tensor<B, D>> {
        check_tensor_rank(D)?;
        let dims = tensor.dims();
        let current = spatial_dims(&dims);
        if extents.len() != current.len() {
            return Err(RegistrationError::dimension_mismatch(format!(
                "cannot resize {} spatial axes to {:?}",
                current.len(),
                extents
            )));
        }
        validate_extents(current)?;
        validate_extents(extents)?;

        let device = tensor.device();
        let mut resized = tensor;
        for (axis, (&n, &m)) in current.iter().zip(extents).enumerate() {
            if n == m {
                continue;
            }
            resized = self.resize_axis(resized, axis + 2, n, m, &device);
        }
        Ok(resized)
    }

    fn resize_axis<B: Backend, const D: usize>(
        &self,
        tensor: Tensor<B, D>,
        dim: usize,
        n: usize,
        m: usize,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let mut weight_shape = [1usize; D];
        weight_shape[dim] = m;

        let mut resized: Option<Tensor<B, D>> = None;
        for (indices, weights) in self.axis_taps(n, m) {
            let indices =
                Tensor::<B, 1, Int>::from_data(TensorData::new(indices, Shape::new([m])), device);
            let weights = Tensor::<B, 1>::from_data(TensorData::new(weights, Shape::new([m])), device)
                .reshape(weight_shape);
            let term = tensor.clone().select(dim, indices) * weights;
            resized = Some(match resized {
                Some(acc) => acc + term,
                None => term,
            });
        }
        resized.unwrap_or(tensor)
    }

    /// Clamped source indices and weights of every tap for an `n -> m` resize.
    fn axis_taps(&self, n: usize, m: usize) -> Vec<(Vec<i32>, Vec<f32>)> {
        let last = (n - 1) as i64;
        let sources: Vec<f64> = (0..m).map(|j| source_coordinate(j, n, m)).collect();

        self.offsets()
            .iter()
            .map(|&offset| {
                let mut indices = Vec::with_capacity(m);
                let mut weights = Vec::with_capacity(m);
                for &src in &sources {
                    let base = src.floor();
                    let tap = base as i64 + offset;
                    indices.push(tap.clamp(0, last) as i32);
                    weights.push(self.weight(src - base - offset as f64) as f32);
                }
                (indices, weights)
            })
            .collect()
    }
}

/// Corner-aligned source coordinate of output index `j`.
fn source_coordinate(j: usize, n: usize, m: usize) -> f64 {
    if m == 1 {
        return (n - 1) as f64 / 2.0;
    }
    j as f64 * (n - 1) as f64 / (m - 1) as f64
}
