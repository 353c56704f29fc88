use burn::module::Module;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use dirnet_core::{RegistrationError, VolumeGeometry};
use dirnet_model::{FieldPredictor, FieldPredictorConfig};

type B = NdArray<f32>;

fn predictor(extents: Vec<usize>) -> FieldPredictor<B> {
    let device = Default::default();
    let geometry = VolumeGeometry::new(extents).unwrap();
    FieldPredictorConfig::new(geometry).init(&device).unwrap()
}

#[test]
fn test_forward_shape_volume() {
    let device = Default::default();
    let model = predictor(vec![8, 12, 20]);
    let input = Tensor::<B, 5>::random([2, 2, 8, 12, 20], Distribution::Normal(0.0, 1.0), &device);

    let field = model.forward(input).unwrap();

    // 8 -> 1, 12 -> 1, 20 -> 2 after four rounded-up halvings
    assert_eq!(field.dims(), [2, 3, 1, 1, 2]);
    assert_eq!(model.field_geometry().extents(), &[1, 1, 2]);
}

#[test]
fn test_forward_shape_planar() {
    let device = Default::default();
    let model = predictor(vec![32, 20]);
    let input = Tensor::<B, 4>::random([1, 2, 32, 20], Distribution::Normal(0.0, 1.0), &device);

    let field = model.forward(input).unwrap();
    assert_eq!(field.dims(), [1, 2, 2, 2]);
}

#[test]
fn test_repeated_forward_reuses_parameters() {
    let device = Default::default();
    let model = predictor(vec![16, 16, 16]);
    let params = model.num_params();
    let ids = model.parameter_ids();
    let input = Tensor::<B, 5>::random([1, 2, 16, 16, 16], Distribution::Normal(0.0, 1.0), &device);

    let first = model.forward(input.clone()).unwrap();
    let second = model.forward(input).unwrap();

    assert_eq!(model.num_params(), params);
    assert_eq!(model.parameter_ids(), ids);
    assert_eq!(
        first.into_data().to_vec::<f32>().unwrap(),
        second.into_data().to_vec::<f32>().unwrap()
    );
}

#[test]
fn test_parameter_listing() {
    let model = predictor(vec![16, 16, 16]);
    let shapes = model.parameter_shapes();
    // 6 blocks with conv weight and four norm tensors, head weight and bias
    assert_eq!(shapes.len(), 32);
    assert_eq!(shapes[0], ("blocks.0.conv.weight".to_string(), vec![16, 2, 3, 3, 3]));
    assert_eq!(shapes[5], ("blocks.1.conv.weight".to_string(), vec![16, 16, 3, 3, 3]));
    assert_eq!(shapes[30], ("head.weight".to_string(), vec![3, 16, 1, 1, 1]));
    assert_eq!(shapes[31], ("head.bias".to_string(), vec![3]));

    let device = Default::default();
    let geometry = VolumeGeometry::new(vec![16, 16]).unwrap();
    let plain: FieldPredictor<B> = FieldPredictorConfig::new(geometry)
        .with_batch_norm(false)
        .with_channels(8)
        .init(&device)
        .unwrap();
    let shapes = plain.parameter_shapes();
    assert_eq!(shapes.len(), 14);
    assert_eq!(shapes[0].1, vec![8, 2, 1, 3, 3]);
    assert_eq!(shapes[1], ("blocks.0.conv.bias".to_string(), vec![8]));
    assert_eq!(shapes[13], ("head.bias".to_string(), vec![2]));
}

#[test]
fn test_rejects_wrong_channels() {
    let device = Default::default();
    let model = predictor(vec![8, 8, 8]);
    let input = Tensor::<B, 5>::zeros([1, 3, 8, 8, 8], &device);

    let err = model.forward(input).unwrap_err();
    assert!(matches!(err, RegistrationError::ShapeMismatch { .. }));
}

#[test]
fn test_rejects_wrong_spatial_shape() {
    let device = Default::default();
    let model = predictor(vec![8, 8, 8]);
    let input = Tensor::<B, 5>::zeros([1, 2, 8, 8, 16], &device);

    let err = model.forward(input).unwrap_err();
    assert!(matches!(err, RegistrationError::ShapeMismatch { .. }));
}

#[test]
fn test_rejects_planar_input_for_volume_predictor() {
    let device = Default::default();
    let model = predictor(vec![8, 8, 8]);
    let input = Tensor::<B, 4>::zeros([1, 2, 8, 8], &device);

    let err = model.forward(input).unwrap_err();
    assert!(matches!(err, RegistrationError::DimensionMismatch(_)));
}

#[test]
fn test_rejects_zero_channels() {
    let device = Default::default();
    let geometry = VolumeGeometry::new(vec![8, 8, 8]).unwrap();
    let result = FieldPredictorConfig::new(geometry).with_channels(0).init::<B>(&device);
    assert!(matches!(result, Err(RegistrationError::InvalidConfiguration(_))));
}
