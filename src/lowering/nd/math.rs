//! Elementwise math, comparisons and value generators

use tracing::warn;

use super::{broadcast_chain, load_constant, load_input_constants};
use crate::builder::{BinaryOp, CompareOp, LayerKind, LogicalOp, MathOp, UnaryMode};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::{float_attr_or_input, strs, LoweringCx};
use crate::proto::onnx::tensor_proto::DataType;
use crate::tensor::scalar;

/// Largest finite `f32`, the open bound of `Clip`
const CLIP_BOUND: f32 = 3.402_823_5e38;

/// Element types a `Cast` rounds toward
const INTEGER_TARGETS: [DataType; 7] = [
    DataType::Uint8,
    DataType::Int8,
    DataType::Uint16,
    DataType::Int32,
    DataType::Int64,
    DataType::Uint32,
    DataType::Uint64,
];

// ============================================================================
// Unary math
// ============================================================================

/// Math layer for an op type, and whether its constant inputs are loaded first
fn math_op(op_type: &str) -> Option<(MathOp, bool)> {
    let entry = match op_type {
        "Acos" => (MathOp::Acos, true),
        "Acosh" => (MathOp::Acosh, true),
        "Asin" => (MathOp::Asin, true),
        "Asinh" => (MathOp::Asinh, true),
        "Atan" => (MathOp::Atan, true),
        "Atanh" => (MathOp::Atanh, true),
        "Cos" => (MathOp::Cos, true),
        "Cosh" => (MathOp::Cosh, true),
        "Erf" => (MathOp::Erf, true),
        "Tanh" => (MathOp::Tanh, true),
        "Ceil" => (MathOp::Ceil, false),
        "Floor" => (MathOp::Floor, false),
        "Round" => (MathOp::Round, false),
        _ => return None,
    };
    Some(entry)
}

pub(super) fn math(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some((op, loads_constants)) = math_op(&node.op_type) else {
        return cx.unsupported_op(node);
    };
    if loads_constants {
        load_input_constants(cx, node)?;
    }
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Math { op },
    )
}

// ============================================================================
// Broadcasting arithmetic
// ============================================================================

fn binary_op(op_type: &str) -> Option<BinaryOp> {
    let op = match op_type {
        "Add" | "Sum" => BinaryOp::Add,
        "Sub" => BinaryOp::Subtract,
        "Mul" => BinaryOp::Multiply,
        "Div" => BinaryOp::Divide,
        "Pow" => BinaryOp::Pow,
        "Max" => BinaryOp::Max,
        "Min" => BinaryOp::Min,
        "Mod" => BinaryOp::Mod,
        _ => return None,
    };
    Some(op)
}

pub(super) fn broadcastable(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(op) = binary_op(&node.op_type) else {
        return cx.unsupported_op(node);
    };
    load_input_constants(cx, node)?;
    broadcast_chain(cx, node, op, node.first_output())
}

/// Sum chain into `{output}_sum`, then a divide by the input count
pub(super) fn mean(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let output = node.first_output();
    let divider = format!("{}_divider", output);
    let sum = format!("{}_sum", output);

    load_input_constants(cx, node)?;
    load_constant(
        cx,
        &format!("{}_divider", node.name),
        &divider,
        &scalar(node.inputs.len() as f32),
    )?;
    broadcast_chain(cx, node, BinaryOp::Add, &sum)?;
    cx.emit(
        &format!("{}_mean", node.name),
        &[sum.as_str(), divider.as_str()],
        &[output],
        LayerKind::Broadcastable {
            op: BinaryOp::Divide,
        },
    )
}

// ============================================================================
// Comparison, logic and selection
// ============================================================================

pub(super) fn compare(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let op = match node.op_type.as_str() {
        "Equal" => CompareOp::Equal,
        "Greater" => CompareOp::Greater,
        "Less" => CompareOp::Less,
        _ => return cx.unsupported_op(node),
    };
    load_input_constants(cx, node)?;
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::Compare { op, alpha: None },
    )
}

pub(super) fn logical(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let op = match node.op_type.as_str() {
        "And" => LogicalOp::And,
        "Or" => LogicalOp::Or,
        "Xor" => LogicalOp::Xor,
        "Not" => LogicalOp::Not,
        _ => return cx.unsupported_op(node),
    };
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::Logical { op },
    )
}

pub(super) fn where_op(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::WhereBroadcastable,
    )
}

// ============================================================================
// Copies and casts
// ============================================================================

pub(super) fn identity(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    cx.identity(&node.name, node.first_input(), node.first_output())
}

/// Casts to an integer type round down; every other target is a copy
pub(super) fn cast(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let to = node.attrs.int_or("to", DataType::Float as i64);
    let to_integer = INTEGER_TARGETS.iter().any(|&t| t as i64 == to);
    if to_integer {
        return cx.emit1(
            &node.name,
            node.first_input(),
            node.first_output(),
            LayerKind::Math { op: MathOp::Floor },
        );
    }
    load_input_constants(cx, node)?;
    cx.identity(&node.name, node.first_input(), node.first_output())
}

/// Bounds come from attributes, or from constant inputs 1 and 2
pub(super) fn clip(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let min = float_attr_or_input(node, "min", 1).unwrap_or(-CLIP_BOUND);
    let max = float_attr_or_input(node, "max", 2).unwrap_or(CLIP_BOUND);
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Clip { min, max },
    )
}

// ============================================================================
// Softmax
// ============================================================================

/// Softmax over `axis` of a blob of unknown rank
fn softmax_nd(cx: &mut LoweringCx<'_>, node: &Node, axis: i64, output: &str) -> ConvertResult<()> {
    cx.emit1(
        &node.name,
        node.first_input(),
        output,
        LayerKind::SoftmaxNd { axis },
    )
}

/// Rank-5 softmax over the channel slot
///
/// The input is padded to rank 5 with leading axes, the softmax axis is
/// swapped into slot 2 when needed, and the padding is squeezed off again.
fn softmax_expanded(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    rank: usize,
    axis: i64,
    output: &str,
) -> ConvertResult<()> {
    const CHANNEL_SLOT: usize = 2;
    let lead = 5 - rank;
    let pad_axes: Vec<i64> = (0..lead as i64).collect();
    let axis = if axis < 0 { axis + rank as i64 } else { axis };
    if axis < 0 || axis >= rank as i64 {
        return cx.reject(node, format!("axis {} out of range for rank {}", axis, rank));
    }
    let axis = axis as usize + lead;

    let mut current = node.first_input().to_string();
    let mut result = output.to_string();
    if lead > 0 {
        let expanded = format!("{}_{}_expanded", node.name, node.first_input());
        cx.emit1(
            &format!("{}_expand_dims", node.name),
            &current,
            &expanded,
            LayerKind::ExpandDims {
                axes: pad_axes.clone(),
            },
        )?;
        current = expanded;
        result = format!("{}_expanded", output);
    }

    let swap: Option<Vec<i64>> = (axis != CHANNEL_SLOT).then(|| {
        let mut perm: Vec<i64> = (0..5).collect();
        perm.swap(CHANNEL_SLOT, axis);
        perm
    });
    if let Some(perm) = &swap {
        let transposed = format!("{}_transposed", current);
        cx.emit1(
            &format!("{}_transpose", node.name),
            &current,
            &transposed,
            LayerKind::Transpose { axes: perm.clone() },
        )?;
        current = transposed;
        result = format!("{}_transposed", result);
    }

    cx.emit1(&node.name, &current, &result, LayerKind::Softmax)?;
    current = result;

    if let Some(perm) = swap {
        let restored = if lead > 0 {
            format!("{}_transposed_back", current)
        } else {
            output.to_string()
        };
        cx.emit1(
            &format!("{}_transpose_back", node.name),
            &current,
            &restored,
            LayerKind::Transpose { axes: perm },
        )?;
        current = restored;
    }

    if lead > 0 {
        cx.emit1(
            &format!("{}_squeeze_dims", node.name),
            &current,
            output,
            LayerKind::Squeeze {
                axes: Some(pad_axes),
            },
        )?;
    }
    Ok(())
}

/// `Softmax` and `LogSoftmax`; the latter appends a log
pub(super) fn softmax(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 1);
    let is_log = node.op_type == "LogSoftmax";
    let softmax_out = if is_log {
        format!("{}_softmax", node.first_output())
    } else {
        node.first_output().to_string()
    };

    match cx.rank(node.first_input()) {
        Some(rank) if rank <= 5 => softmax_expanded(cx, node, rank, axis, &softmax_out)?,
        _ => softmax_nd(cx, node, axis, &softmax_out)?,
    }

    if is_log {
        cx.emit1(
            &format!("{}_log", node.name),
            &softmax_out,
            node.first_output(),
            LayerKind::unary(UnaryMode::Log),
        )?;
    }
    Ok(())
}

// ============================================================================
// Random values
// ============================================================================

/// ONNX stores the seed as a float
fn seed(node: &Node) -> i64 {
    node.attrs
        .int("seed")
        .or_else(|| node.attrs.float("seed").map(|s| s as i64))
        .unwrap_or(-1)
}

/// `RandomNormal`, `RandomUniform` and their `*Like` variants
///
/// The element type attribute is ignored; the target computes in float.
pub(super) fn random(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let attrs = &node.attrs;
    let seed = seed(node);
    let is_like = node.op_type.ends_with("Like");
    if attrs.contains("dtype") {
        warn!(node = %node.name, "dtype attribute ignored for random values");
    }

    let kind = match (node.op_type.starts_with("RandomNormal"), is_like) {
        (true, true) => LayerKind::RandomNormalLike {
            mean: attrs.float_or("mean", 0.0),
            stddev: attrs.float_or("scale", 1.0),
            seed,
        },
        (false, true) => LayerKind::RandomUniformLike {
            minval: attrs.float_or("low", 0.0),
            maxval: attrs.float_or("high", 1.0),
            seed,
        },
        (normal, false) => {
            let Some(shape) = attrs.ints("shape") else {
                return cx.reject(node, "Shape not provided");
            };
            if normal {
                LayerKind::RandomNormalStatic {
                    shape,
                    mean: attrs.float_or("mean", 0.0),
                    stddev: attrs.float_or("scale", 1.0),
                    seed,
                }
            } else {
                LayerKind::RandomUniformStatic {
                    shape,
                    minval: attrs.float_or("low", 0.0),
                    maxval: attrs.float_or("high", 1.0),
                    seed,
                }
            }
        }
    };

    if is_like {
        load_input_constants(cx, node)?;
        cx.emit1(&node.name, node.first_input(), node.first_output(), kind)
    } else {
        cx.emit(&node.name, &[], &[node.first_output()], kind)
    }
}
