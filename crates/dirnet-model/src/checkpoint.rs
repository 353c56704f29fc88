//! Predictor checkpoints.
//!
//! A checkpoint at `path` is two files: `path.mpk`, the named MessagePack
//! record of the predictor, and `path.json`, a manifest with the predictor
//! configuration and the name and shape of every persisted tensor. Loading
//! compares the manifest with the live predictor before touching any
//! parameter.

use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use dirnet_core::RegistrationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::network::{FieldPredictor, FieldPredictorConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Config, Debug)]
pub struct CheckpointManifest {
    pub predictor: FieldPredictorConfig,
    pub parameters: Vec<ParameterEntry>,
}

impl CheckpointManifest {
    pub fn describe<B: Backend>(predictor: &FieldPredictor<B>) -> Self {
        let parameters = predictor
            .parameter_shapes()
            .into_iter()
            .map(|(name, shape)| ParameterEntry { name, shape })
            .collect();
        Self::new(predictor.config().clone(), parameters)
    }

    /// First difference between this manifest and `live`, if any.
    pub fn mismatch(&self, live: &CheckpointManifest) -> Option<String> {
        if self.parameters.len() != live.parameters.len() {
            return Some(format!(
                "checkpoint has {} tensors, predictor has {}",
                self.parameters.len(),
                live.parameters.len()
            ));
        }
        self.parameters
            .iter()
            .zip(&live.parameters)
            .find(|(saved, current)| saved != current)
            .map(|(saved, current)| {
                format!(
                    "checkpoint tensor {} {:?} does not match predictor tensor {} {:?}",
                    saved.name, saved.shape, current.name, current.shape
                )
            })
    }
}

pub fn record_path(path: &Path) -> PathBuf {
    path.with_extension("mpk")
}

pub fn manifest_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Persist the predictor's parameters under `path`.
pub fn save<B: Backend>(predictor: &FieldPredictor<B>, path: &Path) -> dirnet_core::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            RegistrationError::checkpoint(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    CheckpointManifest::describe(predictor)
        .save(manifest_path(path))
        .map_err(|e| RegistrationError::checkpoint(format!("cannot write manifest: {}", e)))?;
    predictor
        .clone()
        .save_file(record_path(path), &recorder())
        .map_err(|e| RegistrationError::checkpoint(format!("cannot write record: {:?}", e)))?;

    tracing::info!("Saved checkpoint to {}", record_path(path).display());
    Ok(())
}

/// Read the manifest stored next to a checkpoint.
pub fn read_manifest(path: &Path) -> dirnet_core::Result<CheckpointManifest> {
    let manifest_file = manifest_path(path);
    CheckpointManifest::load(&manifest_file).map_err(|e| {
        RegistrationError::checkpoint(format!("cannot read {}: {}", manifest_file.display(), e))
    })
}

/// Restore saved parameters into `predictor`.
///
/// # Errors
/// * `Checkpoint` if either file cannot be read
/// * `CheckpointMismatch` if tensor names or shapes differ from the live
///   architecture
pub fn load<B: Backend>(
    predictor: FieldPredictor<B>,
    path: &Path,
    device: &B::Device,
) -> dirnet_core::Result<FieldPredictor<B>> {
    let saved = read_manifest(path)?;
    let live = CheckpointManifest::describe(&predictor);
    if let Some(reason) = saved.mismatch(&live) {
        return Err(RegistrationError::checkpoint_mismatch(reason));
    }
    if saved.predictor.geometry != live.predictor.geometry {
        tracing::warn!(
            "Checkpoint trained on {:?}, loading into predictor for {:?}",
            saved.predictor.geometry.extents(),
            live.predictor.geometry.extents()
        );
    }

    let predictor = predictor
        .load_file(record_path(path), &recorder(), device)
        .map_err(|e| RegistrationError::checkpoint(format!("cannot read record: {:?}", e)))?;
    tracing::info!("Loaded checkpoint from {}", record_path(path).display());
    Ok(predictor)
}
