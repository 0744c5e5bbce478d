//! Axis mapping of declared model inputs
//!
//! | rank | mapping |
//! |------|---------|
//! | 0, 1 | `[C]` |
//! | 2 | `[B, C]` |
//! | 3 | `[S, B, C]` before a recurrent op, `[B, C, W]` before a spatial op, else `[C, H, W]` |
//! | 4 | `[B, C, H, W]` |
//!
//! Higher ranks need an explicit per-input assignment.

use smallvec::smallvec;

use crate::error::{ConvertError, ConvertResult};

use super::{mapping_from_indices, Axis, AxisMapping};

/// Ops whose rank-3 input is read as `[Sequence, Batch, Channel]`
pub const SEQUENCE_OPS: &[&str] = &["LSTM"];

/// Ops whose rank-3 input is read as `[Batch, Channel, Width]`
pub const SPATIAL_OPS: &[&str] = &[
    "MaxPool",
    "AveragePool",
    "BatchNormalization",
    "GlobalAveragePool",
    "GlobalLpPool",
    "GlobalMaxPool",
    "InstanceNormalization",
    "LRN",
    "LpPool",
    "Conv",
    "ConvTranspose",
];

/// Whether the op consumes rank-3 blobs as sequences
pub fn is_sequence_op(op_type: &str) -> bool {
    SEQUENCE_OPS.contains(&op_type)
}

/// Axis assignment and target feature shape of one model input
#[derive(Debug, Clone, PartialEq)]
pub struct InputLayout {
    /// Slot per ONNX dimension
    pub mapping: AxisMapping,
    /// `[C, H, W]`-style shape declared on the target feature
    pub feature_shape: Vec<i64>,
}

/// Legacy layout of a model input
///
/// `consumers` are the op types reading the input; only a single consumer
/// disambiguates rank 3. `user_map` overrides the rules and must have one
/// entry per dimension.
pub fn input_layout(
    name: &str,
    shape: &[i64],
    consumers: &[String],
    user_map: Option<&[i64]>,
) -> ConvertResult<InputLayout> {
    use Axis::*;

    if let Some(user_map) = user_map {
        if user_map.len() != shape.len() {
            return Err(ConvertError::InvalidConfig(format!(
                "input axis map for '{}' has {} entries but the input has rank {}",
                name,
                user_map.len(),
                shape.len()
            )));
        }
        let mapping = mapping_from_indices(user_map)?;
        let mut feature_shape = vec![1, 1, 1];
        for (i, slot) in [Channel, Height, Width].into_iter().enumerate() {
            if let Some(pos) = mapping.iter().position(|&a| a == slot) {
                feature_shape[i] = shape[pos];
            }
        }
        return Ok(InputLayout {
            mapping,
            feature_shape,
        });
    }

    let layout = match shape.len() {
        0 => InputLayout {
            mapping: smallvec![Channel],
            feature_shape: vec![1, 1, 1],
        },
        1 => InputLayout {
            mapping: smallvec![Channel],
            feature_shape: shape.to_vec(),
        },
        2 => InputLayout {
            mapping: smallvec![Batch, Channel],
            feature_shape: vec![shape[1]],
        },
        3 => match consumers {
            [op] if is_sequence_op(op) => InputLayout {
                mapping: smallvec![Sequence, Batch, Channel],
                feature_shape: vec![shape[2]],
            },
            [op] if SPATIAL_OPS.contains(&op.as_str()) => InputLayout {
                mapping: smallvec![Batch, Channel, Width],
                feature_shape: vec![shape[1], 1, shape[2]],
            },
            _ => InputLayout {
                mapping: smallvec![Channel, Height, Width],
                feature_shape: shape.to_vec(),
            },
        },
        4 => InputLayout {
            mapping: smallvec![Batch, Channel, Height, Width],
            feature_shape: shape[1..].to_vec(),
        },
        _ => {
            return Err(ConvertError::UnsupportedConfiguration {
                op_type: "Input".to_string(),
                node: name.to_string(),
                reason: format!(
                    "input cannot be more than rank 4 without an explicit axis map (shape {:?})",
                    shape
                ),
            })
        }
    };
    Ok(layout)
}
