//! Tensor conversion utilities
//!
//! Decode ONNX TensorProto initializers into `f32` ndarrays. Integer
//! tensors (shapes, indices, axes) are carried as `f32` too and read back
//! with [`tensor_to_i64`].

use half::f16;
use ndarray::{Array, ArrayD, IxDyn};

use crate::error::{ConvertError, ConvertResult};
use crate::proto::onnx::tensor_proto::DataType;
use crate::proto::TensorProto;

use super::dtype::{dtype_size, i32_to_dtype};
use super::shape::numel;
use super::Tensor;

/// Decode a TensorProto into an `f32` ndarray
///
/// Handles both `raw_data` and the typed data fields.
pub fn tensor_from_proto(tensor: &TensorProto) -> ConvertResult<Tensor> {
    let dtype = i32_to_dtype(tensor.data_type)?;
    let shape: Vec<usize> = tensor.dims.iter().map(|&d| d.max(0) as usize).collect();
    let expected_len = numel(&tensor.dims);

    let data: Vec<f32> = if !tensor.raw_data.is_empty() {
        decode_raw_to_f32(&tensor.raw_data, dtype, expected_len)?
    } else {
        match dtype {
            DataType::Float => tensor.float_data.clone(),
            DataType::Double => tensor.double_data.iter().map(|&v| v as f32).collect(),
            DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::Uint16
            | DataType::Uint8
            | DataType::Bool => tensor.int32_data.iter().map(|&v| v as f32).collect(),
            // half floats travel as their bit patterns
            DataType::Float16 => tensor
                .int32_data
                .iter()
                .map(|&v| f16::from_bits(v as u16).to_f32())
                .collect(),
            DataType::Int64 => tensor.int64_data.iter().map(|&v| v as f32).collect(),
            DataType::Uint64 | DataType::Uint32 => {
                tensor.uint64_data.iter().map(|&v| v as f32).collect()
            }
            _ => {
                return Err(ConvertError::InvalidDataType(tensor.data_type));
            }
        }
    };

    if data.len() != expected_len {
        return Err(ConvertError::Structural(format!(
            "Initializer {}: data length {} does not match shape {:?}",
            tensor.name,
            data.len(),
            tensor.dims
        )));
    }

    Array::from_shape_vec(IxDyn(&shape), data).map_err(|e| ConvertError::Internal(e.to_string()))
}

/// Build a tensor from a shape and flat data
pub fn tensor_from_vec(shape: &[usize], data: Vec<f32>) -> ConvertResult<Tensor> {
    Array::from_shape_vec(IxDyn(shape), data).map_err(|e| ConvertError::Internal(e.to_string()))
}

/// Rank-0 tensor
pub fn scalar(value: f32) -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), value)
}

/// Read a constant as integers (shapes, axes, indices)
pub fn tensor_to_i64(tensor: &Tensor) -> Vec<i64> {
    tensor.iter().map(|&v| v.round() as i64).collect()
}

// ============================================================================
// Internal helpers
// ============================================================================

fn decode_raw_to_f32(raw: &[u8], dtype: DataType, expected: usize) -> ConvertResult<Vec<f32>> {
    let elem_size = dtype_size(dtype)?;
    if raw.len() != expected * elem_size {
        return Err(ConvertError::Structural(format!(
            "Raw data size {} does not match expected {} * {}",
            raw.len(),
            expected,
            elem_size
        )));
    }

    match dtype {
        DataType::Float => Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        DataType::Double => Ok(raw
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        DataType::Int32 => Ok(raw
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect()),
        DataType::Int64 => Ok(raw
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        DataType::Int16 => Ok(raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32)
            .collect()),
        DataType::Uint16 => Ok(raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32)
            .collect()),
        DataType::Float16 => Ok(raw
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        DataType::Uint32 => Ok(raw
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect()),
        DataType::Uint64 => Ok(raw
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect()),
        DataType::Uint8 | DataType::Bool => Ok(raw.iter().map(|&b| b as f32).collect()),
        DataType::Int8 => Ok(raw.iter().map(|&b| b as i8 as f32).collect()),
        _ => Err(ConvertError::InvalidDataType(dtype as i32)),
    }
}
