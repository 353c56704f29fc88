use burn::tensor::{Distribution, Shape, Tensor, TensorData};
use burn_ndarray::NdArray;
use dirnet_core::{InterpolationKernel, RegistrationError};
use proptest::prelude::*;

type B = NdArray<f32>;

fn ramp(n: usize, slope: f32, offset: f32) -> Vec<f32> {
    (0..n).map(|i| slope * i as f32 + offset).collect()
}

fn line<const D: usize>(values: &[f32], shape: [usize; D]) -> Tensor<B, D> {
    let device = Default::default();
    let data = TensorData::new(values.to_vec(), Shape::new([values.len()]));
    Tensor::<B, 1>::from_data(data, &device).reshape(shape)
}

#[test]
fn test_resize_to_same_shape_is_exact() {
    let device = Default::default();
    let tensor = Tensor::<B, 5>::random([2, 3, 4, 5, 6], Distribution::Uniform(-1.0, 1.0), &device);

    for kernel in [InterpolationKernel::Cubic, InterpolationKernel::Linear] {
        let resized = kernel.resize(tensor.clone(), &[4, 5, 6]).unwrap();
        assert_eq!(resized.dims(), [2, 3, 4, 5, 6]);
        assert_eq!(
            resized.into_data().to_vec::<f32>().unwrap(),
            tensor.clone().into_data().to_vec::<f32>().unwrap()
        );
    }
}

#[test]
fn test_cubic_reproduces_linear_field_on_lattice() {
    let values = ramp(5, 2.0, 1.0);
    let field = line(&values, [1, 1, 1, 5]);

    let resized = InterpolationKernel::Cubic.resize(field, &[1, 9]).unwrap();
    let out = resized.into_data().to_vec::<f32>().unwrap();

    // even outputs sit exactly on source samples
    for (j, v) in out.iter().enumerate().step_by(2) {
        let expected = values[j / 2];
        assert!((v - expected).abs() < 1e-5, "output {} = {}, expected {}", j, v, expected);
    }
}

#[test]
fn test_cubic_reproduces_linear_field_in_interior() {
    let values = ramp(8, -0.5, 3.0);
    let field = line(&values, [1, 1, 8, 1]);

    let resized = InterpolationKernel::Cubic.resize(field, &[15, 1]).unwrap();
    let out = resized.into_data().to_vec::<f32>().unwrap();

    // taps stay inside the source away from the first and last interval
    for (j, v) in out.iter().enumerate().take(12).skip(2) {
        let src = j as f32 * 7.0 / 14.0;
        let expected = -0.5 * src + 3.0;
        assert!((v - expected).abs() < 1e-4, "output {} = {}, expected {}", j, v, expected);
    }
}

#[test]
fn test_linear_kernel_reproduces_linear_field_everywhere() {
    let values = ramp(4, 1.5, -2.0);
    let field = line(&values, [1, 1, 1, 1, 4]);

    let resized = InterpolationKernel::Linear.resize(field, &[1, 1, 10]).unwrap();
    let out = resized.into_data().to_vec::<f32>().unwrap();

    for (j, v) in out.iter().enumerate() {
        let src = j as f32 * 3.0 / 9.0;
        let expected = 1.5 * src - 2.0;
        assert!((v - expected).abs() < 1e-5, "output {} = {}, expected {}", j, v, expected);
    }
}

#[test]
fn test_downsample_to_single_sample_takes_centre() {
    let field = line(&[0.0, 1.0, 2.0, 3.0, 4.0], [1, 1, 5, 1]);

    let resized = InterpolationKernel::Linear.resize(field, &[1, 1]).unwrap();
    let value = resized.into_data().to_vec::<f32>().unwrap()[0];
    assert!((value - 2.0).abs() < 1e-6);
}

#[test]
fn test_upsample_from_single_sample_is_constant() {
    let device = Default::default();
    let field = Tensor::<B, 5>::ones([1, 3, 1, 1, 1], &device).mul_scalar(0.75);

    let resized = InterpolationKernel::Cubic.resize(field, &[4, 4, 4]).unwrap();
    assert_eq!(resized.dims(), [1, 3, 4, 4, 4]);
    for v in resized.into_data().to_vec::<f32>().unwrap() {
        assert!((v - 0.75).abs() < 1e-6);
    }
}

#[test]
fn test_rejects_wrong_extent_count() {
    let device = Default::default();
    let field = Tensor::<B, 5>::zeros([1, 3, 2, 2, 2], &device);

    let err = InterpolationKernel::Cubic.resize(field, &[4, 4]).unwrap_err();
    assert!(matches!(err, RegistrationError::DimensionMismatch(_)));
}

#[test]
fn test_rejects_zero_target_extent() {
    let device = Default::default();
    let field = Tensor::<B, 4>::zeros([1, 2, 2, 2], &device);

    let err = InterpolationKernel::Linear.resize(field, &[4, 0]).unwrap_err();
    assert!(matches!(err, RegistrationError::DegenerateGeometry(_)));
}

proptest! {
    #[test]
    fn test_constant_field_stays_constant(
        h in 1usize..6, w in 1usize..6,
        th in 1usize..12, tw in 1usize..12,
        value in -5.0f32..5.0,
        cubic in any::<bool>(),
    ) {
        let device = Default::default();
        let kernel = if cubic { InterpolationKernel::Cubic } else { InterpolationKernel::Linear };
        let field = Tensor::<B, 4>::ones([1, 2, h, w], &device).mul_scalar(value);

        let resized = kernel.resize(field, &[th, tw]).unwrap();
        prop_assert_eq!(resized.dims(), [1, 2, th, tw]);
        for v in resized.into_data().to_vec::<f32>().unwrap() {
            prop_assert!((v - value).abs() < 1e-4);
        }
    }
}
