use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::Path;

/// Dense `f32` samples in row-major order, slowest axis first.
///
/// NIfTI stores `[x, y, z, ..]` with `x` fastest; a host volume holds the
/// same samples with its axes reversed (`[.., z, y, x]`), which is the
/// spatial order of channels-first tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct HostVolume {
    pub extents: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostVolume {
    pub fn new(extents: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = extents.iter().product();
        anyhow::ensure!(
            data.len() == expected,
            "volume {:?} needs {} samples, got {}",
            extents,
            expected,
            data.len()
        );
        Ok(Self { extents, data })
    }

    /// Copy a tensor to host memory, keeping its logical shape.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let extents = tensor.dims().to_vec();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {:?}", e))?;
        Self::new(extents, data)
    }

    /// Upload as a tensor of rank `D`; the extents must have rank `D`.
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        anyhow::ensure!(
            self.extents.len() == D,
            "cannot upload a rank-{} volume as a rank-{} tensor",
            self.extents.len(),
            D
        );
        let data = TensorData::new(self.data.clone(), self.extents.clone());
        Ok(Tensor::<B, D>::from_data(data, device))
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }
}

/// Read a NIfTI file (`.nii` or `.nii.gz`) into host memory.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<HostVolume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    let array = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert volume to ndarray")?;

    let array = array.reversed_axes();
    let extents = array.shape().to_vec();
    let data = array.iter().copied().collect();
    HostVolume::new(extents, data)
}

/// Write a host volume; a `.gz` suffix selects gzip compression.
pub fn write_volume<P: AsRef<Path>>(path: P, volume: &HostVolume) -> Result<()> {
    let path = path.as_ref();
    let array = ArrayD::from_shape_vec(IxDyn(&volume.extents), volume.data.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create ndarray: {}", e))?;

    WriterOptions::new(path)
        .write_nifti(&array.reversed_axes())
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    tracing::debug!("Wrote {:?} volume to {}", volume.extents, path.display());
    Ok(())
}

/// Read a 3D NIfTI file as a `[depth, height, width]` tensor.
pub fn read_nifti<B: Backend, P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Tensor<B, 3>> {
    let volume = read_volume(path)?;
    anyhow::ensure!(
        volume.extents.len() == 3,
        "Expected 3D NIfTI file, found {} dimensions",
        volume.extents.len()
    );
    volume.to_tensor(device)
}

/// Write any tensor as NIfTI, its last axis becoming NIfTI `x`.
pub fn write_nifti<B: Backend, const D: usize, P: AsRef<Path>>(path: P, tensor: Tensor<B, D>) -> Result<()> {
    write_volume(path, &HostVolume::from_tensor(tensor)?)
}
