//! Paired moving/fixed NIfTI volumes on disk.
//!
//! Moving and fixed volumes live in two directories and are paired by
//! sorted file name position.

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rayon::prelude::*;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::nifti_io::{read_volume, HostVolume};

fn is_nifti(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Sorted NIfTI files of a directory.
pub fn list_nifti_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    files.retain(|p| p.is_file() && is_nifti(p));
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct NiftiPairDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
}

impl NiftiPairDataset {
    /// Pair the NIfTI files of two directories.
    pub fn open<P: AsRef<Path>>(moving_dir: P, fixed_dir: P) -> Result<Self> {
        let moving = list_nifti_files(moving_dir.as_ref())?;
        let fixed = list_nifti_files(fixed_dir.as_ref())?;
        anyhow::ensure!(
            moving.len() == fixed.len(),
            "{} moving volumes but {} fixed volumes",
            moving.len(),
            fixed.len()
        );
        tracing::info!(
            "Found {} volume pairs in {} / {}",
            moving.len(),
            moving_dir.as_ref().display(),
            fixed_dir.as_ref().display()
        );
        Ok(Self {
            pairs: moving.into_iter().zip(fixed).collect(),
        })
    }

    pub fn from_pairs(pairs: Vec<(PathBuf, PathBuf)>) -> Self {
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(PathBuf, PathBuf)] {
        &self.pairs
    }

    /// Load `range` as `[n, 1, depth, height, width]` moving and fixed
    /// batches. Files are decoded in parallel; every volume must share the
    /// first one's extents.
    pub fn load_batch<B: Backend>(
        &self,
        range: Range<usize>,
        device: &B::Device,
    ) -> Result<(Tensor<B, 5>, Tensor<B, 5>)> {
        anyhow::ensure!(
            range.start < range.end && range.end <= self.pairs.len(),
            "batch {:?} outside dataset of {} pairs",
            range,
            self.pairs.len()
        );
        let selected = &self.pairs[range];

        let volumes = selected
            .par_iter()
            .map(|(moving, fixed)| Ok::<_, anyhow::Error>((read_volume(moving)?, read_volume(fixed)?)))
            .collect::<Result<Vec<_>>>()?;

        let extents = volumes[0].0.extents.clone();
        anyhow::ensure!(extents.len() == 3, "expected 3D volumes, got extents {:?}", extents);
        for ((moving, fixed), (moving_path, fixed_path)) in volumes.iter().zip(selected) {
            anyhow::ensure!(
                moving.extents == extents,
                "{} has extents {:?}, expected {:?}",
                moving_path.display(),
                moving.extents,
                extents
            );
            anyhow::ensure!(
                fixed.extents == extents,
                "{} has extents {:?}, expected {:?}",
                fixed_path.display(),
                fixed.extents,
                extents
            );
        }

        let (moving, fixed): (Vec<HostVolume>, Vec<HostVolume>) = volumes.into_iter().unzip();
        Ok((stack(moving, &extents, device)?, stack(fixed, &extents, device)?))
    }
}

fn stack<B: Backend>(volumes: Vec<HostVolume>, extents: &[usize], device: &B::Device) -> Result<Tensor<B, 5>> {
    let mut shape = vec![volumes.len(), 1];
    shape.extend_from_slice(extents);
    let data = volumes.into_iter().flat_map(|v| v.data).collect();
    HostVolume::new(shape, data)?.to_tensor(device)
}
