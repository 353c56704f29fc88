use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use clap::{Parser, Subcommand};
use dirnet_core::{DisplacementUnits, ExecutionContext, InterpolationKernel, VolumeGeometry};
use dirnet_io::{read_volume, ExportOptions, NiftiPairDataset};
use dirnet_model::checkpoint::read_manifest;
use dirnet_model::{
    FieldPredictorConfig, LossReport, Mode, RegistrationConfig, RegistrationModel, SimilarityKind,
};
use dirnet_registration::{evaluate_source, NiftiBatches, TrainingConfig, TrainingSession};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

mod progress_bar;

use progress_bar::EpochProgressBar;

#[cfg(not(feature = "wgpu"))]
type Backend = Autodiff<burn::backend::NdArray<f32>>;
#[cfg(feature = "wgpu")]
type Backend = Autodiff<burn::backend::Wgpu>;

#[derive(Parser)]
#[command(name = "dirnet")]
#[command(about = "Unsupervised deformable registration of NIfTI volume pairs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a field predictor on paired moving/fixed volumes
    Train {
        /// Directory of moving volumes
        moving_dir: PathBuf,

        /// Directory of fixed volumes, paired with moving volumes by sorted name
        fixed_dir: PathBuf,

        /// JSON registration config; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value_t = 10)]
        epochs: usize,

        #[arg(short, long, default_value_t = 1)]
        batch_size: usize,

        #[arg(long)]
        learning_rate: Option<f64>,

        /// Weight of the smoothness term
        #[arg(long)]
        lambda: Option<f64>,

        /// Local NCC window extent (odd)
        #[arg(long)]
        window: Option<usize>,

        /// Score similarity with a single global NCC
        #[arg(long)]
        global_ncc: bool,

        /// Upsample fields linearly instead of with the cubic kernel
        #[arg(long)]
        linear_upsampling: bool,

        /// Treat predicted displacements as normalized grid offsets
        #[arg(long)]
        normalized_units: bool,

        /// Disable batch normalization in the predictor
        #[arg(long)]
        no_batch_norm: bool,

        #[arg(short, long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,

        /// Save a checkpoint every N epochs (0: final checkpoint only)
        #[arg(long, default_value_t = 0)]
        checkpoint_every: usize,

        /// Continue from an existing checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Stop after this many epochs without improvement
        #[arg(long)]
        patience: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Evaluate a checkpoint on paired volumes and optionally export diagnostics
    Evaluate {
        /// Checkpoint base path (without extension)
        checkpoint: PathBuf,

        moving_dir: PathBuf,

        fixed_dir: PathBuf,

        /// JSON registration config providing the loss settings
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value_t = 1)]
        batch_size: usize,

        /// Directory receiving moving/fixed/warped volumes
        #[arg(long)]
        image_dir: Option<PathBuf>,

        /// File receiving the predicted fields
        #[arg(long)]
        field_path: Option<PathBuf>,
    },

    /// Print the manifest of a checkpoint
    Inspect {
        /// Checkpoint base path (without extension)
        checkpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            moving_dir,
            fixed_dir,
            config,
            epochs,
            batch_size,
            learning_rate,
            lambda,
            window,
            global_ncc,
            linear_upsampling,
            normalized_units,
            no_batch_norm,
            checkpoint_dir,
            checkpoint_every,
            resume,
            patience,
            seed,
        } => {
            let dataset = NiftiPairDataset::open(&moving_dir, &fixed_dir)?;
            anyhow::ensure!(!dataset.is_empty(), "no NIfTI pairs in {}", moving_dir.display());
            let geometry = dataset_geometry(&dataset)?;

            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => RegistrationConfig::new(FieldPredictorConfig::new(geometry.clone())),
            };
            anyhow::ensure!(
                config.predictor.geometry == geometry,
                "config geometry {:?} does not match volumes {:?}",
                config.predictor.geometry.extents(),
                geometry.extents()
            );
            if let Some(learning_rate) = learning_rate {
                config.learning_rate = learning_rate;
            }
            if let Some(lambda) = lambda {
                config.loss.lambda = lambda;
            }
            if let Some(window) = window {
                config.loss.window = window;
            }
            if global_ncc {
                config.loss.similarity = SimilarityKind::Global;
            }
            if linear_upsampling {
                config.resampler.field_kernel = InterpolationKernel::Linear;
            }
            if normalized_units {
                config.resampler.units = DisplacementUnits::Normalized;
            }
            if no_batch_norm {
                config.predictor.batch_norm = false;
            }

            let training = TrainingConfig::new()
                .with_epochs(epochs)
                .with_checkpoint_every(checkpoint_every)
                .with_checkpoint_dir(Some(checkpoint_dir.to_string_lossy().into_owned()))
                .with_early_stopping_patience(patience);

            train(config, training, dataset, batch_size, &checkpoint_dir, resume, seed)?;
        }
        Commands::Evaluate {
            checkpoint,
            moving_dir,
            fixed_dir,
            config,
            batch_size,
            image_dir,
            field_path,
        } => {
            let mut export = ExportOptions::none();
            if let Some(dir) = image_dir {
                export = export.with_image_dir(dir);
            }
            if let Some(path) = field_path {
                export = export.with_field_path(path);
            }
            evaluate(&checkpoint, &moving_dir, &fixed_dir, config, batch_size, &export)?;
        }
        Commands::Inspect { checkpoint } => {
            inspect(&checkpoint)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RegistrationConfig> {
    RegistrationConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))
}

/// Geometry of the first moving volume; the dataset checks the rest batch by
/// batch.
fn dataset_geometry(dataset: &NiftiPairDataset) -> Result<VolumeGeometry> {
    let (first, _) = &dataset.pairs()[0];
    let volume = read_volume(first)?;
    anyhow::ensure!(
        volume.extents.len() == 3,
        "{} is not a 3D volume ({:?})",
        first.display(),
        volume.extents
    );
    Ok(VolumeGeometry::new(volume.extents)?)
}

fn context(seed: Option<u64>) -> ExecutionContext<Backend> {
    let context = ExecutionContext::new(Default::default());
    match seed {
        Some(seed) => context.with_seed(seed),
        None => context,
    }
}

fn train(
    config: RegistrationConfig,
    training: TrainingConfig,
    dataset: NiftiPairDataset,
    batch_size: usize,
    checkpoint_dir: &Path,
    resume: Option<PathBuf>,
    seed: Option<u64>,
) -> Result<()> {
    std::fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("Failed to create {}", checkpoint_dir.display()))?;
    let config_path = checkpoint_dir.join("registration.json");
    config
        .save(&config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let mut model = RegistrationModel::<Backend>::new(config, Mode::Train, context(seed))?;
    if let Some(path) = resume {
        info!("Resuming from {}", path.display());
        model.load(&path)?;
    }

    let batches = NiftiBatches::new(dataset, batch_size)?;
    let mut session = TrainingSession::new(model, training.clone())?;
    session.add_callback(Arc::new(EpochProgressBar::new(training.epochs)?));

    let summary = session.run(&batches)?;
    info!(
        "Trained {} epochs in {:.1}s: loss {:.6}, ncc {:.6}{}",
        summary.epochs_completed,
        summary.elapsed.as_secs_f64(),
        summary.final_report.loss,
        summary.final_report.ncc(),
        if summary.stopped_early { " (stopped early)" } else { "" }
    );
    for path in &summary.checkpoints {
        info!("Checkpoint: {}", path.display());
    }

    session.into_model().dispose();
    Ok(())
}

fn evaluate(
    checkpoint: &Path,
    moving_dir: &Path,
    fixed_dir: &Path,
    config: Option<PathBuf>,
    batch_size: usize,
    export: &ExportOptions,
) -> Result<LossReport> {
    let manifest = read_manifest(checkpoint)?;
    let config = evaluation_config(manifest.predictor, config.as_deref())?;

    let mut model = RegistrationModel::<Backend>::new(config, Mode::Infer, context(None))?;
    model.load(checkpoint)?;

    let dataset = NiftiPairDataset::open(moving_dir, fixed_dir)?;
    let batches = NiftiBatches::new(dataset, batch_size)?;
    let report = evaluate_source::<Backend, _, 5>(&model, &batches, export)?;

    info!(
        "Evaluation: loss {:.6}, ncc {:.6}, smoothness {:.6}, floored {:.1}%",
        report.loss,
        report.ncc(),
        report.smoothness_loss,
        report.floored_fraction * 100.0
    );
    model.dispose();
    Ok(report)
}

/// Loss and resampler settings come from `config` when given; the predictor
/// always comes from the checkpoint.
fn evaluation_config(predictor: FieldPredictorConfig, config: Option<&Path>) -> Result<RegistrationConfig> {
    match config {
        Some(path) => {
            let mut config = load_config(path)?;
            config.predictor = predictor;
            Ok(config)
        }
        None => Ok(RegistrationConfig::new(predictor)),
    }
}

fn inspect(checkpoint: &Path) -> Result<()> {
    let manifest = read_manifest(checkpoint)?;
    let predictor = &manifest.predictor;

    println!("Geometry:        {:?}", predictor.geometry.extents());
    println!("Field geometry:  {:?}", predictor.field_geometry().extents());
    println!("Input channels:  {}", predictor.input_channels());
    println!("Hidden channels: {}", predictor.channels);
    println!("Kernel size:     {}", predictor.kernel_size);
    println!("Batch norm:      {}", predictor.batch_norm);

    let total: usize = manifest
        .parameters
        .iter()
        .map(|entry| entry.shape.iter().product::<usize>())
        .sum();
    println!("Tensors:         {} ({} values)", manifest.parameters.len(), total);
    for entry in &manifest.parameters {
        println!("  {:<28} {:?}", entry.name, entry.shape);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, Tensor};
    use clap::CommandFactory;
    use dirnet_io::write_nifti;
    use dirnet_model::RegistrationLossConfig;

    fn predictor(extent: usize) -> FieldPredictorConfig {
        FieldPredictorConfig::new(VolumeGeometry::new(vec![extent; 3]).unwrap())
            .with_channels(4)
            .with_batch_norm(false)
    }

    /// Config with a non-default window and a predictor unrelated to any
    /// checkpoint.
    fn write_loss_config(path: &Path) {
        RegistrationConfig::new(predictor(4))
            .with_loss(RegistrationLossConfig::new().with_window(3).with_lambda(0.5))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train_overrides() {
        let cli = Cli::try_parse_from([
            "dirnet", "train", "moving", "fixed", "-e", "3", "--window", "5", "--global-ncc", "--patience", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Train {
                epochs,
                window,
                global_ncc,
                patience,
                checkpoint_dir,
                ..
            } => {
                assert_eq!(epochs, 3);
                assert_eq!(window, Some(5));
                assert!(global_ncc);
                assert_eq!(patience, Some(2));
                assert_eq!(checkpoint_dir, PathBuf::from("checkpoints"));
            }
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn test_evaluation_config_keeps_checkpoint_predictor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registration.json");
        write_loss_config(&path);

        let config = evaluation_config(predictor(8), Some(&path)).unwrap();
        assert_eq!(config.loss.window, 3);
        assert_eq!(config.loss.lambda, 0.5);
        assert_eq!(config.predictor.geometry.extents(), &[8, 8, 8]);

        let config = evaluation_config(predictor(8), None).unwrap();
        assert_eq!(config.loss.window, RegistrationLossConfig::new().window);
        assert_eq!(config.predictor.geometry.extents(), &[8, 8, 8]);

        assert!(evaluation_config(predictor(8), Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_evaluate_with_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("model");
        RegistrationModel::<Backend>::new(
            RegistrationConfig::new(predictor(8)),
            Mode::Infer,
            context(Some(3)),
        )
        .unwrap()
        .save(&checkpoint)
        .unwrap();

        let moving_dir = dir.path().join("moving");
        let fixed_dir = dir.path().join("fixed");
        std::fs::create_dir_all(&moving_dir).unwrap();
        std::fs::create_dir_all(&fixed_dir).unwrap();
        let device = Default::default();
        for name in ["a.nii.gz", "b.nii.gz"] {
            let volume = Tensor::<burn::backend::NdArray<f32>, 3>::random(
                [8, 8, 8],
                Distribution::Uniform(0.0, 1.0),
                &device,
            );
            write_nifti(moving_dir.join(name), volume.clone()).unwrap();
            write_nifti(fixed_dir.join(name), volume).unwrap();
        }

        let config_path = dir.path().join("registration.json");
        write_loss_config(&config_path);
        let images = dir.path().join("images");
        let report = evaluate(
            &checkpoint,
            &moving_dir,
            &fixed_dir,
            Some(config_path),
            2,
            &ExportOptions::none().with_image_dir(&images),
        )
        .unwrap();

        assert!(report.loss.is_finite());
        assert!(report.ncc() <= 1.0 + 1e-6);
        assert!(images.join("0_x.nii.gz").exists());
    }

    #[test]
    fn test_inspect_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(&dir.path().join("absent")).is_err());
    }
}
