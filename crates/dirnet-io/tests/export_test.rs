use anyhow::Result;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use dirnet_io::export::image_file_name;
use dirnet_io::{export_diagnostics, read_volume, write_nifti, ExportOptions, ImageRole, NiftiPairDataset};
use tempfile::tempdir;

type B = NdArray<f32>;

#[test]
fn test_export_writes_numbered_samples_and_field() -> Result<()> {
    let dir = tempdir()?;
    let device = Default::default();
    let moving = Tensor::<B, 5>::random([2, 1, 3, 4, 5], Distribution::Uniform(0.0, 1.0), &device);
    let fixed = Tensor::<B, 5>::random([2, 1, 3, 4, 5], Distribution::Uniform(0.0, 1.0), &device);
    let warped = moving.clone();
    let field = Tensor::<B, 5>::zeros([2, 3, 1, 1, 1], &device);

    let options = ExportOptions::none()
        .with_image_dir(dir.path().join("images"))
        .with_field_path(dir.path().join("fields").join("batch.nii.gz"))
        .with_start_index(10);

    let written = export_diagnostics(&options, moving.clone(), fixed, warped, field)?;
    assert_eq!(written.len(), 7);

    for index in [10, 11] {
        for role in [ImageRole::Moving, ImageRole::Fixed, ImageRole::Warped] {
            let path = dir.path().join("images").join(image_file_name(index, role));
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    let second = read_volume(dir.path().join("images").join("11_x.nii.gz"))?;
    assert_eq!(second.extents, vec![3, 4, 5]);
    let expected = moving.narrow(0, 1, 1).into_data().to_vec::<f32>().unwrap();
    assert_eq!(second.data, expected);

    let field = read_volume(dir.path().join("fields").join("batch.nii.gz"))?;
    assert_eq!(field.extents, vec![2, 3, 1, 1, 1]);
    Ok(())
}

#[test]
fn test_export_disabled_writes_nothing() -> Result<()> {
    let device = Default::default();
    let image = Tensor::<B, 4>::zeros([1, 1, 4, 4], &device);
    let field = Tensor::<B, 4>::zeros([1, 2, 1, 1], &device);

    let written = export_diagnostics(&ExportOptions::none(), image.clone(), image.clone(), image, field)?;
    assert!(written.is_empty());
    Ok(())
}

#[test]
fn test_dataset_pairs_sorted_files() -> Result<()> {
    let dir = tempdir()?;
    let device = Default::default();
    let moving_dir = dir.path().join("moving");
    let fixed_dir = dir.path().join("fixed");
    std::fs::create_dir_all(&moving_dir)?;
    std::fs::create_dir_all(&fixed_dir)?;

    for (i, name) in ["b.nii.gz", "a.nii.gz", "c.nii"].iter().enumerate() {
        let volume = Tensor::<B, 3>::ones([2, 3, 4], &device).mul_scalar(i as f32);
        write_nifti(moving_dir.join(name), volume.clone())?;
        write_nifti(fixed_dir.join(name), volume.add_scalar(100.0))?;
    }
    std::fs::write(moving_dir.join("notes.txt"), "ignored")?;

    let dataset = NiftiPairDataset::open(&moving_dir, &fixed_dir)?;
    assert_eq!(dataset.len(), 3);
    assert!(dataset.pairs()[0].0.ends_with("a.nii.gz"));

    let (moving, fixed) = dataset.load_batch::<B>(0..2, &device)?;
    assert_eq!(moving.dims(), [2, 1, 2, 3, 4]);
    assert_eq!(fixed.dims(), [2, 1, 2, 3, 4]);

    // a.nii.gz was written second (value 1), b.nii.gz first (value 0)
    let moving = moving.into_data().to_vec::<f32>().unwrap();
    assert_eq!(moving[0], 1.0);
    assert_eq!(moving[24], 0.0);
    let fixed = fixed.into_data().to_vec::<f32>().unwrap();
    assert_eq!(fixed[0], 101.0);
    Ok(())
}

#[test]
fn test_dataset_rejects_unbalanced_directories() -> Result<()> {
    let dir = tempdir()?;
    let device = Default::default();
    let moving_dir = dir.path().join("moving");
    let fixed_dir = dir.path().join("fixed");
    std::fs::create_dir_all(&moving_dir)?;
    std::fs::create_dir_all(&fixed_dir)?;
    write_nifti(moving_dir.join("a.nii"), Tensor::<B, 3>::zeros([2, 2, 2], &device))?;

    assert!(NiftiPairDataset::open(&moving_dir, &fixed_dir).is_err());
    Ok(())
}
