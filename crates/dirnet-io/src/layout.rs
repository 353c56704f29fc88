//! Conversion between the channels-last `[batch, *spatial, channels]`
//! layout used by patch pipelines and the channels-first layout of the
//! registration network.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use dirnet_core::geometry::check_tensor_rank;
use dirnet_core::Result;

/// `[batch, *spatial, channels]` to `[batch, channels, *spatial]`.
pub fn channels_last_to_first<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Tensor<B, D>> {
    check_tensor_rank(D)?;
    Ok(tensor.movedim(D - 1, 1))
}

/// `[batch, channels, *spatial]` to `[batch, *spatial, channels]`.
pub fn channels_first_to_last<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Tensor<B, D>> {
    check_tensor_rank(D)?;
    Ok(tensor.movedim(1, D - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Shape, TensorData};
    use burn_ndarray::NdArray;
    use dirnet_core::RegistrationError;

    type B = NdArray<f32>;

    #[test]
    fn test_channels_last_to_first_moves_channel_axis() {
        let device = Default::default();
        // [1, 2, 3, 2] with value 10 * channel + position
        let values: Vec<f32> = (0..6)
            .flat_map(|p| (0..2).map(move |c| (10 * c + p) as f32))
            .collect();
        let tensor = Tensor::<B, 4>::from_data(TensorData::new(values, Shape::new([1, 2, 3, 2])), &device);

        let first = channels_last_to_first(tensor.clone()).unwrap();
        assert_eq!(first.dims(), [1, 2, 2, 3]);
        let data = first.clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(&data[..6], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(&data[6..], &[10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);

        let back = channels_first_to_last(first).unwrap();
        assert_eq!(
            back.into_data().to_vec::<f32>().unwrap(),
            tensor.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_unsupported_rank() {
        let device = Default::default();
        let tensor = Tensor::<B, 3>::zeros([1, 4, 2], &device);
        assert!(matches!(
            channels_last_to_first(tensor),
            Err(RegistrationError::DimensionMismatch(_))
        ));
    }
}
