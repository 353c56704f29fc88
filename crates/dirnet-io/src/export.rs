//! Diagnostic export of registration batches.
//!
//! For sample `i` of a batch, `{start + i}_x.nii.gz` holds the moving
//! image, `{start + i}_y.nii.gz` the fixed image and `{start + i}_z.nii.gz`
//! the warped image, channel 0 only. The raw predicted field of the whole
//! batch goes to a single NIfTI file.

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::nifti_io::{write_volume, HostVolume};

/// Where to persist diagnostics; absent paths disable that export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Directory receiving per-sample moving/fixed/warped volumes.
    pub image_dir: Option<PathBuf>,
    /// File receiving the raw field of the batch.
    pub field_path: Option<PathBuf>,
    /// Index of the first sample in file names.
    pub start_index: usize,
}

impl ExportOptions {
    /// No exports.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = Some(dir.into());
        self
    }

    pub fn with_field_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_start_index(mut self, start_index: usize) -> Self {
        self.start_index = start_index;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.image_dir.is_some() || self.field_path.is_some()
    }
}

/// Role of an exported image, encoded as the file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Moving,
    Fixed,
    Warped,
}

impl ImageRole {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Moving => "x",
            Self::Fixed => "y",
            Self::Warped => "z",
        }
    }
}

/// File name of one exported sample image.
pub fn image_file_name(index: usize, role: ImageRole) -> String {
    format!("{}_{}.nii.gz", index, role.suffix())
}

/// Channel 0 of every sample as host volumes.
fn first_channel_samples<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<HostVolume>> {
    let volume = HostVolume::from_tensor(tensor.narrow(1, 0, 1))?;
    let batch = volume.extents[0];
    let spatial = volume.extents[2..].to_vec();
    let per_sample: usize = spatial.iter().product();

    volume
        .data
        .chunks(per_sample.max(1))
        .take(batch)
        .map(|chunk| HostVolume::new(spatial.clone(), chunk.to_vec()))
        .collect()
}

/// Write the requested diagnostics and return every file written.
pub fn export_diagnostics<B: Backend, const D: usize>(
    options: &ExportOptions,
    moving: Tensor<B, D>,
    fixed: Tensor<B, D>,
    warped: Tensor<B, D>,
    field: Tensor<B, D>,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    if let Some(dir) = &options.image_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create export directory {}", dir.display()))?;

        let mut jobs = Vec::new();
        for (role, tensor) in [
            (ImageRole::Moving, moving),
            (ImageRole::Fixed, fixed),
            (ImageRole::Warped, warped),
        ] {
            for (i, volume) in first_channel_samples(tensor)?.into_iter().enumerate() {
                let path = dir.join(image_file_name(options.start_index + i, role));
                jobs.push((path, volume));
            }
        }

        jobs.par_iter()
            .map(|(path, volume)| write_volume(path, volume))
            .collect::<Result<Vec<_>>>()?;
        written.extend(jobs.into_iter().map(|(path, _)| path));
    }

    if let Some(path) = &options.field_path {
        ensure_parent(path)?;
        write_volume(path, &HostVolume::from_tensor(field)?)?;
        written.push(path.clone());
    }

    if !written.is_empty() {
        tracing::debug!("Exported {} diagnostic files", written.len());
    }
    Ok(written)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
