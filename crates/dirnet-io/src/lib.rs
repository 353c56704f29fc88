//! Disk-facing collaborators of the registration engine: NIfTI volumes,
//! layout conversion and diagnostic export.

pub mod dataset;
pub mod export;
pub mod layout;
pub mod nifti_io;

pub use dataset::NiftiPairDataset;
pub use export::{export_diagnostics, ExportOptions, ImageRole};
pub use layout::{channels_first_to_last, channels_last_to_first};
pub use nifti_io::{read_nifti, read_volume, write_nifti, write_volume, HostVolume};
