//! Core building blocks for deformable registration: validated geometry,
//! normalized sampling grids, separable field interpolation and the
//! differentiable spatial resampler.

pub mod context;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod interpolation;
pub mod resample;

pub use context::ExecutionContext;
pub use error::{RegistrationError, Result};
pub use geometry::VolumeGeometry;
pub use grid::{DisplacementUnits, SamplingGrid};
pub use interpolation::InterpolationKernel;
pub use resample::{SpatialResampler, SpatialResamplerConfig};
