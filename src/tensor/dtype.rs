//! ONNX data type mappings
//!
//! Maps ONNX TensorProto element types to raw sizes and to the
//! multi-array element types the target description accepts.

use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, ConvertResult};
use crate::proto::onnx::tensor_proto::DataType;

/// Size in bytes for each ONNX data type
pub fn dtype_size(dtype: DataType) -> ConvertResult<usize> {
    match dtype {
        DataType::Float => Ok(4),
        DataType::Uint8 => Ok(1),
        DataType::Int8 => Ok(1),
        DataType::Uint16 => Ok(2),
        DataType::Float16 => Ok(2),
        DataType::Int16 => Ok(2),
        DataType::Int32 => Ok(4),
        DataType::Int64 => Ok(8),
        DataType::Bool => Ok(1),
        DataType::Double => Ok(8),
        DataType::Uint32 => Ok(4),
        DataType::Uint64 => Ok(8),
        _ => Err(ConvertError::InvalidDataType(dtype as i32)),
    }
}

/// Convert i32 to DataType enum
pub fn i32_to_dtype(value: i32) -> ConvertResult<DataType> {
    DataType::try_from(value).map_err(|_| ConvertError::InvalidDataType(value))
}

/// Multi-array element type of a target feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayDataType {
    /// 32-bit float
    Float32,
    /// 64-bit float
    Double,
    /// 32-bit signed integer
    Int32,
}

impl ArrayDataType {
    /// Coerce an ONNX element type into the target's multi-array type
    ///
    /// FLOAT and BOOL become FLOAT32, INT32 and INT64 become INT32, DOUBLE
    /// stays DOUBLE. Anything else cannot be described.
    pub fn from_onnx(elem_type: i32) -> ConvertResult<Self> {
        match i32_to_dtype(elem_type)? {
            DataType::Float | DataType::Bool => Ok(ArrayDataType::Float32),
            DataType::Double => Ok(ArrayDataType::Double),
            DataType::Int32 | DataType::Int64 => Ok(ArrayDataType::Int32),
            _ => Err(ConvertError::InvalidDataType(elem_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(dtype_size(DataType::Float).unwrap(), 4);
        assert_eq!(dtype_size(DataType::Int64).unwrap(), 8);
        assert!(dtype_size(DataType::String).is_err());
    }

    #[test]
    fn test_i32_to_dtype() {
        assert_eq!(i32_to_dtype(1).unwrap(), DataType::Float);
        assert!(i32_to_dtype(999).is_err());
    }

    #[test]
    fn test_array_type_coercion() {
        assert_eq!(ArrayDataType::from_onnx(1).unwrap(), ArrayDataType::Float32);
        assert_eq!(ArrayDataType::from_onnx(9).unwrap(), ArrayDataType::Float32);
        assert_eq!(ArrayDataType::from_onnx(7).unwrap(), ArrayDataType::Int32);
        assert_eq!(ArrayDataType::from_onnx(6).unwrap(), ArrayDataType::Int32);
        assert_eq!(ArrayDataType::from_onnx(11).unwrap(), ArrayDataType::Double);
        assert!(ArrayDataType::from_onnx(8).is_err());
    }
}
