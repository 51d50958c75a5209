//! Tensor bridge: conversions between host buffers (`Vec<f32>`, index lists)
//! and burn tensors.
//!
//! This is the only place where data crosses between the host-side banks and
//! ledger and the tensor computations. Everything past this boundary works on
//! `Tensor<B, D>`.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{ensure_len, AdaptError, Result};

/// Convert a batch of equal-length rows to a burn 2D tensor `(rows, dim)`.
pub fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Result<Tensor<B, 2>> {
    let Some(first) = rows.first() else {
        return Err(AdaptError::ShapeMismatch {
            context: "rows_to_tensor: row count",
            expected: 1,
            actual: 0,
        });
    };
    let dim = first.len();
    for row in rows {
        ensure_len("rows_to_tensor: row length", dim, row.len())?;
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_data(TensorData::new(flat, [rows.len(), dim]), device))
}

/// Build a `(rows, cols)` tensor from a row-major flat buffer.
pub fn flat_to_tensor<B: Backend>(
    flat: &[f32],
    rows: usize,
    cols: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    ensure_len("flat_to_tensor", rows * cols, flat.len())?;
    Ok(Tensor::from_data(
        TensorData::new(flat.to_vec(), [rows, cols]),
        device,
    ))
}

/// Build a 1D float tensor from a slice.
pub fn slice_to_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

/// Build a 1D int tensor of indices (for `select`).
pub fn indices_to_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

/// Flatten any float tensor into a row-major `Vec<f32>`.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Flatten any int tensor into indices. Negative values cannot come out of
/// `argmax`/`topk` and are clamped to zero.
pub fn int_tensor_to_indices<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<usize> {
    tensor
        .into_data()
        .iter::<i64>()
        .map(|v| v.max(0) as usize)
        .collect()
}

/// Extract a single f64 scalar from a burn 1D tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
