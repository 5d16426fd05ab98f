//! Tensor bridge: utilities to move rows between burn tensors and host
//! `Vec`s.
//!
//! Rotation decoding and pose embedding run part of their math on the host;
//! these helpers are the only place that reads tensor data back.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{PolicyError, Result};

/// Build a `(rows, width)` tensor from fixed-width host rows.
///
/// # Errors
/// Returns `MalformedBatch` if `rows` is empty.
pub fn rows_to_tensor<B: Backend, const W: usize>(
    rows: &[[f32; W]],
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    if rows.is_empty() || W == 0 {
        return Err(PolicyError::MalformedBatch("cannot build a tensor from zero rows".into()));
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_data(TensorData::new(flat, [rows.len(), W]), device))
}

/// Read a 2D float tensor back as fixed-width rows.
///
/// # Errors
/// Returns `Data` if the tensor width is not `W` or data cannot be read as f32.
pub fn tensor_to_rows<B: Backend, const W: usize>(tensor: Tensor<B, 2>) -> Result<Vec<[f32; W]>> {
    let [_, width] = tensor.dims();
    if width != W {
        return Err(PolicyError::Data(format!("expected width {W}, got {width}")));
    }
    let flat = tensor_to_vec(tensor)?;
    Ok(flat
        .chunks_exact(W)
        .map(|chunk| {
            let mut row = [0.0_f32; W];
            row.copy_from_slice(chunk);
            row
        })
        .collect())
}

/// Flatten any float tensor into host f32 values.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PolicyError::Data(format!("{e:?}")))
}

/// Flatten an integer tensor into host i64 values.
pub fn int_tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| PolicyError::Data(format!("{e:?}")))
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_rows_round_trip() {
        let device = Default::default();
        let rows = [[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let tensor = rows_to_tensor::<TestBackend, 3>(&rows, &device).unwrap();
        assert_eq!(tensor.dims(), [2, 3]);

        let back = tensor_to_rows::<TestBackend, 3>(tensor).unwrap();
        assert_eq!(back, rows.to_vec());
    }

    #[test]
    fn test_width_mismatch_is_error() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        assert!(matches!(
            tensor_to_rows::<TestBackend, 3>(tensor),
            Err(PolicyError::Data(_))
        ));
        assert!(rows_to_tensor::<TestBackend, 3>(&[], &device).is_err());
    }

    #[test]
    fn test_int_and_scalar_extraction() {
        let device = Default::default();
        let ints = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([3_i64, 0, 7]), &device);
        assert_eq!(int_tensor_to_vec(ints).unwrap(), vec![3, 0, 7]);

        let scalar = Tensor::<TestBackend, 1>::from_data(TensorData::from([42.0_f32]), &device);
        assert!((tensor_to_f64(scalar) - 42.0).abs() < 1e-5);
    }
}
