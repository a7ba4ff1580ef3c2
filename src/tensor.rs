//! Conversions between host containers (`Vec`, `ndarray`) and `burn` tensors.

use crate::error::{BnnError, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;

pub fn vec_to_tensor<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    Tensor::<B, 1>::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f64> {
    tensor.into_data().iter::<f64>().collect()
}

/// Copies `arr` in logical (row-major) order, whatever its memory layout.
pub fn array2_to_tensor<B: Backend>(arr: &Array2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = arr.dim();
    let data: Vec<f64> = arr.iter().copied().collect();
    Tensor::<B, 2>::from_data(TensorData::new(data, [rows, cols]), device)
}

pub fn tensor_to_array2<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [rows, cols] = tensor.dims();
    let data = tensor_to_vec(tensor);
    Array2::from_shape_vec((rows, cols), data).map_err(|e| {
        BnnError::config(format!("cannot view tensor output as a {rows}x{cols} array: {e}"))
    })
}

/// Single element of a one-element tensor as `f64`.
pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    use burn::tensor::ElementConversion;
    tensor.into_scalar().elem::<f64>()
}
