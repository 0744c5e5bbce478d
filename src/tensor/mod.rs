//! Tensor utilities
//!
//! Constant tensors flow through the compiler as `ndarray::ArrayD<f32>`:
//! - Data type table and target dtype coercion (`dtype`)
//! - Shape helpers (`shape`)
//! - Decoding ONNX initializers (`convert`)
//! - The small op set evaluated at compile time (`ops`)
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::tensor::{tensor_from_proto, ops};
//!
//! let w = tensor_from_proto(&initializer)?;
//! let wt = ops::transpose(&w, &[1, 0])?;
//! ```

pub mod convert;
pub mod dtype;
pub mod ops;
pub mod shape;

use ndarray::ArrayD;

/// Constant tensor value
pub type Tensor = ArrayD<f32>;

// Re-export commonly used items
pub use convert::{scalar, tensor_from_proto, tensor_from_vec, tensor_to_i64};
pub use dtype::{i32_to_dtype, ArrayDataType};
pub use shape::{is_static, normalize_axis, numel, shape_of};
