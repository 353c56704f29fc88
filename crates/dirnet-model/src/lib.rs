//! DIRNet-style deformable registration model.
//!
//! A convolutional [`FieldPredictor`] maps a (moving, fixed) pair to a
//! coarse displacement field, the spatial resampler warps the moving image
//! through it, and [`RegistrationLoss`] scores the result.

pub mod checkpoint;
pub mod losses;
pub mod model;
pub mod network;

pub use checkpoint::CheckpointManifest;
pub use dirnet_io::ExportOptions;
pub use losses::{
    GlobalNcc, GradientSmoothness, LocalNcc, LossBreakdown, RegistrationLoss, RegistrationLossConfig,
    SimilarityKind, SimilarityScore, SmoothnessReduction,
};
pub use model::{FieldStatistics, LossReport, Mode, Registration, RegistrationConfig, RegistrationModel};
pub use network::{FieldPredictor, FieldPredictorConfig};
