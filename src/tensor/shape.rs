//! Shape utilities
//!
//! Shapes are `i64` vectors; a negative entry is an unknown dimension.

use crate::error::{ConvertError, ConvertResult};

use super::Tensor;

/// Calculate total number of elements from shape
pub fn numel(shape: &[i64]) -> usize {
    shape.iter().map(|&d| d.max(0) as usize).product()
}

/// True when every dimension is known and positive
pub fn is_static(shape: &[i64]) -> bool {
    shape.iter().all(|&d| d > 0)
}

/// Shape of a constant tensor in `i64`
pub fn shape_of(tensor: &Tensor) -> Vec<i64> {
    tensor.shape().iter().map(|&d| d as i64).collect()
}

/// Normalize axis to positive index
pub fn normalize_axis(axis: i64, ndim: usize) -> ConvertResult<usize> {
    let ndim_i64 = ndim as i64;
    let normalized = if axis < 0 { axis + ndim_i64 } else { axis };

    if normalized < 0 || normalized >= ndim_i64 {
        return Err(ConvertError::Internal(format!(
            "Axis {} out of bounds for ndim {}",
            axis, ndim
        )));
    }

    Ok(normalized as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel() {
        assert_eq!(numel(&[2, 3, 4]), 24);
        assert_eq!(numel(&[]), 1);
    }

    #[test]
    fn test_is_static() {
        assert!(is_static(&[1, 3, 224, 224]));
        assert!(!is_static(&[-1, 3]));
        assert!(!is_static(&[0, 3]));
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4).unwrap(), 3);
        assert!(normalize_axis(4, 4).is_err());
        assert!(normalize_axis(-5, 4).is_err());
    }
}
