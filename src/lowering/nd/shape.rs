//! Shape manipulation, indexing and reductions

use tracing::warn;

use super::{load_constant, load_input_constants, RankExpanded};
use crate::builder::{LayerKind, ReduceOp, ScatterMode};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::legacy::spatial as window;
use crate::lowering::{ints_attr_or_input, float_attr_or_input, strs, LoweringCx};
use crate::tensor::tensor_to_i64;

/// Stand-in extent for axes whose size is unknown
const UNKNOWN_EXTENT: i64 = i64::MAX;

// ============================================================================
// Concat, split and copies
// ============================================================================

pub(super) fn concat(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    if node.inputs.len() == 1 {
        return cx.identity(&node.name, node.first_input(), node.first_output());
    }
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::ConcatNd {
            axis: node.attrs.int_or("axis", 0),
        },
    )
}

/// One output per piece; explicit sizes come from the attribute or input 1
pub(super) fn split(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let split_sizes = ints_attr_or_input(node, "split", 1).unwrap_or_default();
    cx.emit(
        &node.name,
        &[node.first_input()],
        &strs(&node.outputs),
        LayerKind::SplitNd {
            axis: node.attrs.int_or("axis", 0),
            num_splits: node.outputs.len(),
            split_sizes,
        },
    )
}

/// `Constant` becomes a load of its value attribute
pub(super) fn constant(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(value) = node.attrs.tensor("value").cloned() else {
        return cx.reject(node, "Constant requires a tensor value attribute");
    };
    load_constant(cx, &node.name, node.first_output(), &value)
}

/// Filled tensor of a static or runtime shape
pub(super) fn constant_of_shape(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let value = node
        .attrs
        .tensor("value")
        .and_then(|t| t.iter().next().copied())
        .unwrap_or(0.0);
    match node.input_tensor(0) {
        Some(shape) => cx.emit(
            &node.name,
            &[],
            &[node.first_output()],
            LayerKind::FillStatic {
                shape: tensor_to_i64(shape),
                value,
            },
        ),
        None => cx.emit1(
            &node.name,
            node.first_input(),
            node.first_output(),
            LayerKind::FillDynamic { value },
        ),
    }
}

pub(super) fn expand(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    match node.input_tensor(1) {
        Some(shape) => cx.emit1(
            &node.name,
            node.first_input(),
            node.first_output(),
            LayerKind::BroadcastToStatic {
                shape: tensor_to_i64(shape),
            },
        ),
        None => cx.emit(
            &node.name,
            &strs(&node.inputs),
            &[node.first_output()],
            LayerKind::BroadcastToDynamic,
        ),
    }
}

pub(super) fn tile(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    let Some(reps) = node.input_tensor(1).map(tensor_to_i64) else {
        return cx.reject(
            node,
            "CoreML Tile layer does not support dynamic 'reps'. 'reps' should be known statically",
        );
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Tile { reps },
    )
}

// ============================================================================
// Reshapes
// ============================================================================

pub(super) fn flatten(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::FlattenTo2d {
            axis: node.attrs.int_or("axis", 1),
        },
    )
}

/// Static reshapes keep the rank when they can; rank drops made only of
/// copied (`0`) and inferred (`-1`) dims go through a rank-preserving
/// reshape and a squeeze
pub(super) fn reshape(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let input = node.first_input();
    let output = node.first_output();
    let Some(target) = ints_attr_or_input(node, "shape", 1) else {
        load_input_constants(cx, node)?;
        return cx.emit(
            &node.name,
            &strs(&node.inputs),
            &[output],
            LayerKind::ReshapeDynamic,
        );
    };

    let Some(input_shape) = cx.shape(input) else {
        return cx.emit1(
            &node.name,
            input,
            output,
            LayerKind::ReshapeStatic {
                target_shape: target,
            },
        );
    };
    let rank = cx.rank(input).unwrap_or(input_shape.len());

    if target.len() == rank {
        return cx.emit1(
            &node.name,
            input,
            output,
            LayerKind::RankPreservingReshape {
                target_shape: target,
            },
        );
    }

    if rank > target.len() {
        let inferred = target.iter().filter(|&&d| d == -1).count();
        let copied = target.iter().filter(|&&d| d == 0).count();
        if inferred > 1 {
            return cx.reject(
                node,
                format!(
                    "Error in ONNX model: At most one dimension of new shape can be -1, found {}",
                    inferred
                ),
            );
        }
        if inferred + copied == target.len() {
            let mut preserved: Vec<i64> = Vec::with_capacity(rank);
            for &d in &target {
                preserved.push(d);
                if d == -1 {
                    break;
                }
            }
            preserved.resize(rank, 1);

            let kept = format!("{}_reshape_dim_preserved", output);
            cx.emit1(
                &format!("{}_reshape_preserving", node.name),
                input,
                &kept,
                LayerKind::RankPreservingReshape {
                    target_shape: preserved,
                },
            )?;
            let squeezed: Vec<i64> = (target.len() as i64 - rank as i64..0).rev().collect();
            return cx.emit1(
                &node.name,
                &kept,
                output,
                LayerKind::Squeeze {
                    axes: Some(squeezed),
                },
            );
        }
    }

    cx.emit1(
        &node.name,
        input,
        output,
        LayerKind::ReshapeStatic {
            target_shape: target,
        },
    )
}

pub(super) fn squeeze(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Squeeze {
            axes: ints_attr_or_input(node, "axes", 1),
        },
    )
}

pub(super) fn unsqueeze(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(axes) = ints_attr_or_input(node, "axes", 1) else {
        return cx.reject(node, "Unsqueeze requires axes");
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::ExpandDims { axes },
    )
}

/// Missing `perm` reverses the axes
pub(super) fn transpose(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axes = match node.attrs.ints("perm").filter(|p| !p.is_empty()) {
        Some(perm) => perm,
        None => match cx.rank(node.first_input()) {
            Some(rank) => (1..=rank as i64).map(|i| -i).collect(),
            None => return cx.reject(node, "Rank unknown for input"),
        },
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Transpose { axes },
    )
}

// ============================================================================
// Padding
// ============================================================================

/// Constant padding works on any rank; reflect and edge modes use the
/// spatial padding layer
pub(super) fn pad(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    if node.attrs.string_or("mode", "constant") != "constant" {
        return window::pad::<RankExpanded>(cx, node);
    }
    let pad_amounts = ints_attr_or_input(node, "pads", 1).unwrap_or_default();
    let value = float_attr_or_input(node, "value", 2).unwrap_or(0.0);
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::ConstantPad { value, pad_amounts },
    )
}

// ============================================================================
// Slicing and indexing
// ============================================================================

/// Dims of the sliced blob; unknown extents when only the rank is known
fn slice_extent(cx: &LoweringCx<'_>, edge: &str) -> Option<Vec<i64>> {
    match cx.shape(edge) {
        Some(shape) => Some(
            shape
                .into_iter()
                .map(|d| if d < 0 { UNKNOWN_EXTENT } else { d })
                .collect(),
        ),
        None => cx.rank(edge).map(|r| vec![UNKNOWN_EXTENT; r]),
    }
}

/// Static slice from attributes (opset < 10) or constant inputs 1 to 4
///
/// Axes not named keep their full extent through the begin and end masks.
pub(super) fn slice(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(dims) = slice_extent(cx, node.first_input()) else {
        return cx.reject(node, "Input shape not available");
    };
    let rank = dims.len();

    let from_inputs = node.inputs.len() > 1;
    let (starts, ends, axes, steps) = if from_inputs {
        let known = (1..node.inputs.len().min(5)).all(|i| node.is_const_input(i));
        if !known {
            return cx.reject(
                node,
                "CoreML does not support Dynamic Slice with unknown axes. Please provide Custom Function/Layer",
            );
        }
        let read = |i: usize| node.input_tensor(i).map(tensor_to_i64);
        (read(1), read(2), read(3), read(4))
    } else {
        let attrs = &node.attrs;
        (attrs.ints("starts"), attrs.ints("ends"), attrs.ints("axes"), attrs.ints("steps"))
    };
    let (Some(starts), Some(ends)) = (starts, ends) else {
        return cx.reject(node, "Slice requires starts and ends");
    };
    let axes = axes.unwrap_or_else(|| (0..rank as i64).collect());
    if starts.len() < axes.len() || ends.len() < axes.len() {
        return cx.reject(node, "Slice starts and ends must cover every axis");
    }

    let mut begin_ids = vec![0i64; rank];
    let mut end_ids = vec![0i64; rank];
    let mut strides = vec![1i64; rank];
    let mut begin_masks = vec![true; rank];
    let mut end_masks = vec![true; rank];
    for (i, &axis) in axes.iter().enumerate() {
        let axis = match crate::tensor::normalize_axis(axis, rank) {
            Ok(a) => a,
            Err(e) => return cx.reject(node, e.to_string()),
        };
        begin_ids[axis] = starts[i];
        end_ids[axis] = ends[i];
        if ends[i] < dims[axis] {
            end_masks[axis] = false;
        }
        if starts[i] != 0 {
            begin_masks[axis] = false;
        }
        if let Some(step) = steps.as_ref().and_then(|s| s.get(i)) {
            strides[axis] = *step;
        }
    }

    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::SliceStatic {
            begin_ids,
            end_ids,
            strides,
            begin_masks,
            end_masks,
        },
    )
}

/// Constant data and indices are loaded under gather-specific names
pub(super) fn gather(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    if node.inputs.len() != 2 {
        return cx.reject(node, "Error in ONNX model: Gather expects two inputs");
    }
    for (i, suffix) in [(0, "load_data"), (1, "load_indices")] {
        if let Some(value) = node.input_tensor(i) {
            load_constant(cx, &format!("{}_{}", node.name, suffix), &node.inputs[i], value)?;
        }
    }
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::Gather {
            axis: node.attrs.int_or("axis", 0),
        },
    )
}

pub(super) fn scatter(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[node.first_output()],
        LayerKind::ScatterAlongAxis {
            axis: node.attrs.int_or("axis", 0),
            mode: ScatterMode::Update,
        },
    )
}

pub(super) fn non_zero(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::WhereNonZero,
    )
}

/// The target only reverses with `batch_axis < seq_axis`; other orders
/// reverse with swapped axes and transpose back
pub(super) fn reverse_sequence(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let batch_axis = node.attrs.int_or("batch_axis", 1);
    let time_axis = node.attrs.int_or("time_axis", 0);
    let output = node.first_output();

    if batch_axis <= time_axis {
        return cx.emit(
            &node.name,
            &strs(&node.inputs),
            &[output],
            LayerKind::ReverseSequence {
                batch_axis,
                seq_axis: time_axis,
            },
        );
    }

    let Some(rank) = cx.rank(node.first_input()) else {
        return cx.reject(node, "Rank unknown for input");
    };
    let (batch_axis, time_axis) = (time_axis, batch_axis);
    let reversed = format!("{}_before_reverse", output);
    cx.emit(
        &node.name,
        &strs(&node.inputs),
        &[reversed.as_str()],
        LayerKind::ReverseSequence {
            batch_axis,
            seq_axis: time_axis,
        },
    )?;
    let mut axes: Vec<i64> = (0..rank as i64).collect();
    axes.swap(batch_axis as usize, time_axis as usize);
    cx.emit1(
        &format!("{}_transpose", node.name),
        &reversed,
        output,
        LayerKind::Transpose { axes },
    )
}

/// `k` comes from the attribute (opset < 10) or from input 1
pub(super) fn top_k(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    if node.attrs.contains("sorted") {
        warn!(node = %node.name, "sorted attribute is ignored; results are always sorted");
    }
    let k = node
        .attrs
        .int("k")
        .or_else(|| node.input_tensor(1).and_then(|t| tensor_to_i64(t).first().copied()))
        .unwrap_or(1);
    let inputs: Vec<&str> = if node.attrs.contains("k") {
        vec![node.first_input()]
    } else {
        strs(&node.inputs)
    };
    cx.emit(
        &node.name,
        &inputs,
        &strs(&node.outputs),
        LayerKind::TopK {
            k,
            axis: node.attrs.int_or("axis", -1),
            use_bottom_k: node.attrs.int_or("largest", 1) == 0,
        },
    )
}

// ============================================================================
// Reductions
// ============================================================================

fn reduce_op(op_type: &str) -> Option<ReduceOp> {
    let op = match op_type {
        "ReduceSum" => ReduceOp::Sum,
        "ReduceProd" => ReduceOp::Prod,
        "ReduceMean" => ReduceOp::Mean,
        "ReduceMax" => ReduceOp::Max,
        "ReduceMin" => ReduceOp::Min,
        "ReduceL1" => ReduceOp::L1,
        "ReduceL2" => ReduceOp::L2,
        "ReduceLogSum" => ReduceOp::LogSum,
        "ReduceLogSumExp" => ReduceOp::LogSumExp,
        "ReduceSumSquare" => ReduceOp::SumSquare,
        _ => return None,
    };
    Some(op)
}

/// Missing `axes` reduces over every axis
pub(super) fn reduce(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    load_input_constants(cx, node)?;
    let Some(op) = reduce_op(&node.op_type) else {
        return cx.reject(node, format!("Unsupported reduce operation: {}", node.op_type));
    };
    let axes = node.attrs.ints("axes");
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::ReduceNd {
            op,
            reduce_all: axes.is_none(),
            axes,
            keepdims: node.attrs.int_or("keepdims", 1) != 0,
        },
    )
}

/// `ArgMax` and `ArgMin`
pub(super) fn arg_reduce(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 0);
    let keepdims = node.attrs.int_or("keepdims", 1) != 0;
    let kind = if node.op_type == "ArgMin" {
        LayerKind::ArgMin { axis, keepdims }
    } else {
        LayerKind::ArgMax { axis, keepdims }
    };
    cx.emit1(&node.name, node.first_input(), node.first_output(), kind)
}

pub(super) fn get_shape(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    cx.emit1(&node.name, node.first_input(), node.first_output(), LayerKind::GetShape)
}

/// Element count as the product of the shape
pub(super) fn size(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let shape = format!("{}_getshape", node.first_input());
    cx.emit1(&node.name, node.first_input(), &shape, LayerKind::GetShape)?;
    cx.emit1(
        &format!("{}_reduce_prod", node.name),
        &shape,
        node.first_output(),
        LayerKind::ReduceNd {
            op: ReduceOp::Prod,
            axes: None,
            keepdims: true,
            reduce_all: true,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{NeuralNetworkSpec, SpecBuilder};
    use crate::graph::AttrValue;
    use crate::lowering::test_util::{graph, spec_with};
    use crate::lowering::{Dialect, ErrorHandler, LoweringFn};
    use crate::tensor::{scalar, tensor_from_vec, Tensor};

    fn run(node: &Node, shape: &[i64], f: LoweringFn) -> (NeuralNetworkSpec, ConvertResult<()>) {
        let mut g = graph(vec![node.clone()], shape);
        let mut s = spec_with(4, shape);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let result = {
            let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
            f(&mut cx, node)
        };
        (s, result)
    }

    fn ints(values: &[i64]) -> Tensor {
        tensor_from_vec(&[values.len()], values.iter().map(|&v| v as f32).collect()).unwrap()
    }

    fn names(s: &NeuralNetworkSpec) -> Vec<&str> {
        s.layers().iter().map(|l| l.name.as_str()).collect()
    }

    #[test]
    fn test_reshape_same_rank_preserves() {
        let node = Node::new("r", "Reshape", &["x", "s"], &["y"]).with_tensor("s", ints(&[0, 0, 16, 1]));
        let (s, r) = run(&node, &[1, 3, 4, 4], reshape);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::RankPreservingReshape {
                target_shape: vec![0, 0, 16, 1]
            }
        );
    }

    #[test]
    fn test_reshape_rank_drop_squeezes() {
        let node = Node::new("r", "Reshape", &["x", "s"], &["y"]).with_tensor("s", ints(&[0, -1]));
        let (s, r) = run(&node, &[1, 3, 4, 4], reshape);
        r.unwrap();
        assert_eq!(names(&s), vec!["r_reshape_preserving", "r"]);
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::RankPreservingReshape {
                target_shape: vec![0, -1, 1, 1]
            }
        );
        assert_eq!(
            s.layers()[1].kind,
            LayerKind::Squeeze {
                axes: Some(vec![-1, -2])
            }
        );
        assert_eq!(s.rank("y"), Some(2));
    }

    #[test]
    fn test_reshape_variants() {
        let node = Node::new("r", "Reshape", &["x", "s"], &["y"]).with_tensor("s", ints(&[3, 16]));
        let (s, _) = run(&node, &[1, 3, 4, 4], reshape);
        assert!(matches!(s.layers()[0].kind, LayerKind::ReshapeStatic { .. }));

        let node = Node::new("r", "Reshape", &["x", "s"], &["y"]).with_tensor("s", ints(&[-1, -1]));
        let (_, r) = run(&node, &[1, 3, 4, 4], reshape);
        assert!(r.unwrap_err().to_string().contains("found 2"));

        let node = Node::new("r", "Reshape", &["x", "s"], &["y"]);
        let (s, _) = run(&node, &[1, 3, 4, 4], reshape);
        assert_eq!(s.layers()[0].kind, LayerKind::ReshapeDynamic);
        assert_eq!(s.layers()[0].inputs, vec!["x", "s"]);
    }

    #[test]
    fn test_slice_masks_from_inputs() {
        let node = Node::new("sl", "Slice", &["x", "b", "e", "a"], &["y"])
            .with_tensor("b", ints(&[1]))
            .with_tensor("e", ints(&[i64::MAX]))
            .with_tensor("a", ints(&[-1]));
        let (s, r) = run(&node, &[2, 5], slice);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::SliceStatic {
                begin_ids,
                begin_masks,
                end_masks,
                strides,
                ..
            } => {
                assert_eq!(begin_ids, &vec![0, 1]);
                assert_eq!(begin_masks, &vec![true, false]);
                assert_eq!(end_masks, &vec![true, true]);
                assert_eq!(strides, &vec![1, 1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_slice_dynamic_is_rejected() {
        let node = Node::new("sl", "Slice", &["x", "b", "e"], &["y"]).with_tensor("b", ints(&[0]));
        let (_, r) = run(&node, &[2, 5], slice);
        assert!(r.unwrap_err().to_string().contains("Dynamic Slice"));
    }

    #[test]
    fn test_slice_attributes_with_steps() {
        let node = Node::new("sl", "Slice", &["x"], &["y"])
            .with_attr("starts", AttrValue::Ints(vec![0]))
            .with_attr("ends", AttrValue::Ints(vec![2]))
            .with_attr("axes", AttrValue::Ints(vec![1]))
            .with_attr("steps", AttrValue::Ints(vec![2]));
        let (s, r) = run(&node, &[2, 5], slice);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::SliceStatic {
                end_ids,
                end_masks,
                strides,
                ..
            } => {
                assert_eq!(end_ids, &vec![0, 2]);
                assert_eq!(end_masks, &vec![true, false]);
                assert_eq!(strides, &vec![1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_counts_outputs() {
        let node = Node::new("sp", "Split", &["x"], &["a", "b", "c"])
            .with_attr("axis", AttrValue::Int(1));
        let (s, r) = run(&node, &[2, 6], split);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::SplitNd {
                axis: 1,
                num_splits: 3,
                split_sizes: vec![]
            }
        );
        assert_eq!(s.layers()[0].outputs, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_size_is_shape_product() {
        let node = Node::new("n", "Size", &["x"], &["y"]);
        let (s, r) = run(&node, &[2, 6], size);
        r.unwrap();
        assert_eq!(names(&s), vec!["n", "n_reduce_prod"]);
        assert_eq!(s.layers()[0].outputs, vec!["x_getshape"]);
    }

    #[test]
    fn test_gather_loads_constant_indices() {
        let node = Node::new("g", "Gather", &["x", "i"], &["y"]).with_tensor("i", scalar(1.0));
        let (s, r) = run(&node, &[3, 4], gather);
        r.unwrap();
        assert_eq!(names(&s), vec!["g_load_indices", "g"]);
        assert_eq!(s.rank("y"), Some(2));

        let bad = Node::new("g", "Gather", &["x"], &["y"]);
        let (_, r) = run(&bad, &[3, 4], gather);
        assert!(r.is_err());
    }

    #[test]
    fn test_reverse_sequence_transposes_back() {
        let node = Node::new("rv", "ReverseSequence", &["x", "lens"], &["y"])
            .with_attr("batch_axis", AttrValue::Int(2))
            .with_attr("time_axis", AttrValue::Int(0));
        let (s, r) = run(&node, &[5, 1, 2], reverse_sequence);
        r.unwrap();
        assert_eq!(names(&s), vec!["rv", "rv_transpose"]);
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::ReverseSequence {
                batch_axis: 0,
                seq_axis: 2
            }
        );
        assert_eq!(s.layers()[1].kind, LayerKind::Transpose { axes: vec![2, 1, 0] });
    }

    #[test]
    fn test_transpose_defaults_to_reversal() {
        let node = Node::new("t", "Transpose", &["x"], &["y"]);
        let (s, r) = run(&node, &[1, 2, 3], transpose);
        r.unwrap();
        assert_eq!(s.layers()[0].kind, LayerKind::Transpose { axes: vec![-1, -2, -3] });
    }

    #[test]
    fn test_constant_of_shape_static_and_dynamic() {
        let node = Node::new("f", "ConstantOfShape", &["s"], &["y"])
            .with_tensor("s", ints(&[2, 3]))
            .with_attr("value", AttrValue::Tensor(tensor_from_vec(&[1], vec![5.0]).unwrap()));
        let (s, r) = run(&node, &[2], constant_of_shape);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::FillStatic {
                shape: vec![2, 3],
                value: 5.0
            }
        );
        assert!(s.layers()[0].inputs.is_empty());

        let node = Node::new("f", "ConstantOfShape", &["x"], &["y"]);
        let (s, _) = run(&node, &[2], constant_of_shape);
        assert_eq!(s.layers()[0].kind, LayerKind::FillDynamic { value: 0.0 });
    }

    #[test]
    fn test_pad_constant_and_reflect() {
        let node = Node::new("p", "Pad", &["x"], &["y"])
            .with_attr("pads", AttrValue::Ints(vec![0, 1, 0, 1]))
            .with_attr("value", AttrValue::Float(2.0));
        let (s, r) = run(&node, &[2, 3], pad);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::ConstantPad {
                value: 2.0,
                pad_amounts: vec![0, 1, 0, 1]
            }
        );

        let node = Node::new("p", "Pad", &["x"], &["y"])
            .with_attr("mode", AttrValue::String("reflect".into()))
            .with_attr("pads", AttrValue::Ints(vec![0, 0, 1, 0, 0, 1]));
        let (s, r) = run(&node, &[1, 3, 8], pad);
        r.unwrap();
        assert_eq!(names(&s), vec!["p_ip_expand", "p", "p_ip_squeeze_out"]);
    }

    #[test]
    fn test_top_k_from_input() {
        let node = Node::new("k", "TopK", &["x", "kk"], &["v", "i"])
            .with_tensor("kk", ints(&[3]))
            .with_attr("largest", AttrValue::Int(0));
        let (s, r) = run(&node, &[10], top_k);
        r.unwrap();
        assert_eq!(names(&s), vec!["k_load_constant_1", "k"]);
        assert_eq!(
            s.layers()[1].kind,
            LayerKind::TopK {
                k: 3,
                axis: -1,
                use_bottom_k: true
            }
        );
        assert_eq!(s.layers()[1].outputs, vec!["v", "i"]);
    }

    #[test]
    fn test_reduce_without_axes_reduces_all() {
        let node = Node::new("r", "ReduceLogSumExp", &["x"], &["y"])
            .with_attr("keepdims", AttrValue::Int(0));
        let (s, r) = run(&node, &[2, 3], reduce);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::ReduceNd {
                op: ReduceOp::LogSumExp,
                axes: None,
                keepdims: false,
                reduce_all: true
            }
        );
        assert_eq!(s.rank("y"), Some(1));
    }
}
