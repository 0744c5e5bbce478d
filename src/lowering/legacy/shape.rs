//! Reshapes, permutes, joins, slices and reductions

use crate::axis::init::is_sequence_op;
use crate::axis::rules::{
    self, axis_letters, channel_swap, fallback_axis_letters, flatten_like_reshape, reshape_target,
    slot_of, transpose_perm, transpose_perm_unmapped, NATIVE_REDUCE_AXES,
};
use crate::axis::{Axis, AxisMapping};
use crate::builder::{ElementwiseMode, LayerKind, ReduceMode, ReshapeOrder, SliceAxis, UnaryMode};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::{ints_attr_or_input, strs, LoweringCx};
use crate::tensor::{is_static, normalize_axis, tensor_to_i64};

/// Slice ends above this mean "to the end of the axis"
const INT_MAX: i64 = 1 << 30;

// ============================================================================
// Reshape family
// ============================================================================

pub(super) fn reshape(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let target = node
        .attrs
        .ints("shape")
        .filter(|s| !s.is_empty())
        .or_else(|| node.input_tensor(1).map(tensor_to_i64));
    let Some(target) = target else {
        return cx.missing(
            node,
            "CoreML only supports Reshape layer when the target shape is static and known apriori",
        );
    };
    let mapping = cx.mapping(node.first_input());

    if target.iter().all(|s| s.abs() == 1) {
        let out_mapping = match &mapping {
            Some(m) => Some(layout!(cx, node, flatten_like_reshape(m, target.len()))),
            None => None,
        };
        cx.emit1(
            &node.name,
            node.first_input(),
            node.first_output(),
            LayerKind::Flatten {
                order: ReshapeOrder::ChannelFirst,
            },
        )?;
        if let Some(m) = out_mapping {
            cx.set_mapping(node.first_output(), m);
        }
        return Ok(());
    }

    let (shape, out_mapping) = layout!(cx, node, reshape_target(&target, mapping.as_deref()));
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Reshape {
            target_shape: shape,
            order: ReshapeOrder::ChannelFirst,
        },
    )?;
    if let Some(m) = out_mapping {
        cx.set_mapping(node.first_output(), m);
    }
    Ok(())
}

pub(super) fn flatten(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 1);
    let out_mapping = match cx.mapping(node.first_input()) {
        Some(m) => Some(layout!(cx, node, rules::flatten(&m, axis))),
        None => None,
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Flatten {
            order: ReshapeOrder::ChannelFirst,
        },
    )?;
    if let Some(m) = out_mapping {
        cx.set_mapping(node.first_output(), m);
    }
    Ok(())
}

pub(super) fn transpose(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let perm = node.attrs.ints("perm");
    let axes = match cx.mapping(node.first_input()) {
        Some(m) => layout!(cx, node, transpose_perm(&m, perm.as_deref())),
        None => layout!(cx, node, transpose_perm_unmapped(perm.as_deref())),
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Permute { axes },
    )?;
    cx.keep_mapping(node);
    Ok(())
}

fn normalized(axes: &[i64], rank: usize) -> Option<Vec<i64>> {
    axes.iter()
        .map(|&a| normalize_axis(a, rank).ok().map(|a| a as i64))
        .collect()
}

/// Lowered as a copy; only the axis map changes
pub(super) fn squeeze(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axes = ints_attr_or_input(node, "axes", 1);
    let out_mapping = match cx.mapping(node.first_input()) {
        Some(m) => {
            let axes = match &axes {
                Some(a) => match normalized(a, m.len()) {
                    Some(a) => Some(a),
                    None => return cx.reject(node, format!("Squeeze axes {:?} out of range", a)),
                },
                None => None,
            };
            let shape = cx.shape(node.first_input());
            Some(layout!(
                cx,
                node,
                rules::squeeze(&m, axes.as_deref(), shape.as_deref())
            ))
        }
        None => None,
    };
    cx.identity(&node.name, node.first_input(), node.first_output())?;
    if let Some(m) = out_mapping {
        cx.set_mapping(node.first_output(), m);
    }
    Ok(())
}

pub(super) fn unsqueeze(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(axes) = ints_attr_or_input(node, "axes", 1) else {
        return cx.reject(node, "Unsqueeze requires axes");
    };
    let out_mapping = match cx.mapping(node.first_input()) {
        Some(m) => {
            let Some(axes) = normalized(&axes, m.len() + axes.len()) else {
                return cx.reject(node, format!("Unsqueeze axes {:?} out of range", axes));
            };
            Some(layout!(cx, node, rules::unsqueeze(&m, &axes)))
        }
        None => None,
    };
    cx.identity(&node.name, node.first_input(), node.first_output())?;
    if let Some(m) = out_mapping {
        cx.set_mapping(node.first_output(), m);
    }
    Ok(())
}

// ============================================================================
// Concat and split
// ============================================================================

fn concat_kind(mode: ElementwiseMode) -> LayerKind {
    LayerKind::elementwise(mode, None)
}

pub(super) fn concat(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 1);
    let first = node.first_input();

    if let Some(m) = cx.mapping(first) {
        let slot = layout!(cx, node, slot_of(&m, axis));
        if slot == Axis::Batch {
            return cx.reject(node, "Concat not supported along batch axis");
        }
        let mode = if slot == Axis::Sequence {
            ElementwiseMode::SequenceConcat
        } else {
            ElementwiseMode::Concat
        };
        match layout!(cx, node, channel_swap(slot)) {
            Some(perm) if slot != Axis::Sequence => {
                cx.with_transpose(node, &node.inputs, &node.outputs, perm, |cx, i, o| {
                    cx.emit(&node.name, &strs(i), &[o[0].as_str()], concat_kind(mode))
                })?;
            }
            _ => cx.emit(
                &node.name,
                &strs(&node.inputs),
                &[node.first_output()],
                concat_kind(mode),
            )?,
        }
    } else {
        let shape = cx.shape(first);
        let parent_is_sequence = cx
            .graph
            .blob_from_op_type
            .get(first)
            .map_or(false, |op| is_sequence_op(op));
        let mode = match &shape {
            Some(s) if parent_is_sequence && s.len() == 3 => match axis {
                0 => Some(ElementwiseMode::SequenceConcat),
                2 => Some(ElementwiseMode::Concat),
                _ => None,
            },
            Some(s) => matches!((s.len(), axis), (1, 0) | (3, 0) | (4, 1) | (2, 1))
                .then_some(ElementwiseMode::Concat),
            None => match axis {
                0 => Some(ElementwiseMode::SequenceConcat),
                1 => Some(ElementwiseMode::Concat),
                _ => None,
            },
        };
        let Some(mode) = mode else {
            return cx.reject(
                node,
                format!("Unsupported axis {} in input of shape {:?}", axis, shape),
            );
        };
        cx.emit(
            &node.name,
            &strs(&node.inputs),
            &[node.first_output()],
            concat_kind(mode),
        )?;
    }
    cx.keep_mapping(node);
    Ok(())
}

pub(super) fn split(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 0);
    if let Some(splits) = ints_attr_or_input(node, "split", 1) {
        if splits.iter().any(|&s| Some(&s) != splits.first()) {
            return cx.reject(node, "Only Equal splits are supported");
        }
    }
    let kind = LayerKind::Split {
        n_outputs: node.outputs.len(),
    };
    let input = vec![node.first_input().to_string()];
    let mapping = cx.mapping(node.first_input());

    match &mapping {
        Some(m) => {
            let slot = layout!(cx, node, slot_of(m, axis));
            if slot == Axis::Batch {
                return cx.reject(node, "Split along Batch axis not supported");
            }
            match layout!(cx, node, channel_swap(slot)) {
                Some(perm) => {
                    cx.with_transpose(node, &input, &node.outputs, perm, |cx, i, o| {
                        cx.emit(&node.name, &[i[0].as_str()], &strs(o), kind)
                    })?;
                }
                None => cx.emit(&node.name, &strs(&input), &strs(&node.outputs), kind)?,
            }
        }
        None => {
            if axis != 0 && axis != 1 {
                return cx.reject(node, format!("Unsupported axis {}", axis));
            }
            cx.emit(&node.name, &strs(&input), &strs(&node.outputs), kind)?;
        }
    }

    if let Some(m) = mapping {
        for output in &node.outputs {
            cx.set_mapping(output, m.clone());
        }
    }
    Ok(())
}

// ============================================================================
// Slice
// ============================================================================

fn emit_slice(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    input: &str,
    output: &str,
    axis: SliceAxis,
    (start, end): (i64, i64),
) -> ConvertResult<()> {
    cx.emit1(
        &format!("{}_{}", node.name, output),
        input,
        output,
        LayerKind::Slice {
            axis,
            start,
            end,
            stride: 1,
        },
    )
}

/// One slice layer per sliced axis, chained through intermediate blobs
pub(super) fn slice(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let input = node.first_input();
    let output = node.first_output();
    let in_shape = cx.shape(input);
    if in_shape.as_deref().map_or(false, is_static) && in_shape == cx.shape(output) {
        cx.identity(&node.name, input, output)?;
        cx.keep_mapping(node);
        return Ok(());
    }

    let Some(starts) = ints_attr_or_input(node, "starts", 1) else {
        return cx.missing(node, "Slice starts must be an attribute or a graph initializer");
    };
    let Some(mut ends) = ints_attr_or_input(node, "ends", 2) else {
        return cx.missing(node, "Slice ends must be an attribute or a graph initializer");
    };
    let axes = ints_attr_or_input(node, "axes", 3)
        .unwrap_or_else(|| (0..starts.len() as i64).collect());
    if starts.len() != ends.len() || starts.len() != axes.len() || axes.is_empty() {
        return cx.reject(node, "Slice starts, ends and axes must have the same length");
    }
    if let Some(shape) = &in_shape {
        for (end, &axis) in ends.iter_mut().zip(&axes) {
            if *end > INT_MAX {
                if let Ok(a) = normalize_axis(axis, shape.len()) {
                    *end = shape[a];
                }
            }
        }
    }

    match cx.mapping(input) {
        Some(m) => {
            let mut slots = Vec::with_capacity(axes.len());
            for &axis in &axes {
                let slot = layout!(cx, node, slot_of(&m, axis));
                if slot == Axis::Batch {
                    return cx.reject(node, "cannot slice along batch axis");
                }
                slots.push(slot);
            }
            let n = slots.len();
            for (i, slot) in slots.into_iter().enumerate() {
                let iname = if i == 0 {
                    input.to_string()
                } else {
                    format!("{}{}", input, i)
                };
                let oname = if i + 1 == n {
                    output.to_string()
                } else {
                    format!("{}{}", input, i + 1)
                };
                let range = (starts[i], ends[i]);
                match slot {
                    Axis::Sequence => {
                        cx.with_transpose(node, &[iname], &[oname], [1, 0, 2, 3], |cx, i, o| {
                            emit_slice(cx, node, &i[0], &o[0], SliceAxis::Channel, range)
                        })?;
                    }
                    Axis::Height => emit_slice(cx, node, &iname, &oname, SliceAxis::Height, range)?,
                    Axis::Width => emit_slice(cx, node, &iname, &oname, SliceAxis::Width, range)?,
                    _ => emit_slice(cx, node, &iname, &oname, SliceAxis::Channel, range)?,
                }
            }
        }
        None => {
            if axes.len() != 1 {
                return cx.reject(node, "Only single axis Slice is supported now");
            }
            let rank4 = in_shape.as_ref().map_or(false, |s| s.len() == 4);
            let slice_axis = match (rank4, axes[0]) {
                (true, 0) => return cx.reject(node, "cannot slice along batch axis"),
                (true, 1) | (false, 0) => SliceAxis::Channel,
                (true, 2) | (false, 1) => SliceAxis::Height,
                (true, 3) | (false, 2) => SliceAxis::Width,
                _ => {
                    return cx.reject(node, "Slice is supported only along H, W or C dimensions")
                }
            };
            emit_slice(cx, node, input, output, slice_axis, (starts[0], ends[0]))?;
        }
    }
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Reductions
// ============================================================================

fn reduce_mode(op_type: &str) -> Option<ReduceMode> {
    Some(match op_type {
        "ReduceMean" => ReduceMode::Avg,
        "ReduceL1" => ReduceMode::L1,
        "ReduceL2" => ReduceMode::L2,
        "ReduceLogSum" | "ReduceSum" => ReduceMode::Sum,
        "ReduceMax" => ReduceMode::Max,
        "ReduceMin" => ReduceMode::Min,
        "ReduceProd" => ReduceMode::Prod,
        "ReduceSumSquare" => ReduceMode::Sumsquare,
        _ => return None,
    })
}

/// Reduce layer named after what it writes; `ReduceLogSum` finishes with a log
fn emit_reduce(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    mode: ReduceMode,
    input: &str,
    output: &str,
    letters: &str,
    last: bool,
) -> ConvertResult<()> {
    let add_log = last && node.op_type == "ReduceLogSum";
    let reduced = if add_log {
        format!("{}_before_log", output)
    } else {
        output.to_string()
    };
    cx.emit1(
        &format!("{}_{}", node.name, reduced),
        input,
        &reduced,
        LayerKind::Reduce {
            axis: letters.to_string(),
            mode,
            epsilon: 1e-6,
        },
    )?;
    if add_log {
        cx.emit1(
            &format!("{}_log", node.name),
            &reduced,
            output,
            LayerKind::unary(UnaryMode::Log),
        )?;
    }
    Ok(())
}

pub(super) fn reduce(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(mode) = reduce_mode(&node.op_type) else {
        return cx.reject(node, "Unsupported op");
    };
    let input = node.first_input();
    let output = node.first_output();
    let keepdims = node.attrs.int_or("keepdims", 1) != 0;
    let mapping = cx.mapping(input);
    let Some(rank) = mapping.as_ref().map(AxisMapping::len).or_else(|| cx.graph.rank(input)) else {
        return cx.reject(node, "Shape inference failed for reduce op");
    };
    let axes: Vec<usize> = match node.attrs.ints("axes") {
        None => (0..rank).collect(),
        Some(a) => match normalized(&a, rank) {
            Some(a) => a.into_iter().map(|a| a as usize).collect(),
            None => return cx.reject(node, format!("Reduce axes {:?} out of range", a)),
        },
    };
    let untranslatable = format!(
        "Unable to translate axes attribute to CoreML axis parameter for {:?}",
        axes
    );

    let letters = match &mapping {
        Some(m) => layout!(cx, node, axis_letters(m, &axes)),
        None => fallback_axis_letters(rank, &axes),
    };

    if NATIVE_REDUCE_AXES.contains(&letters.as_str()) {
        emit_reduce(cx, node, mode, input, output, &letters, true)?;
    } else {
        let chainable = !letters.is_empty() && letters.chars().all(|c| matches!(c, 'C' | 'H' | 'W'));
        if node.op_type == "ReduceMean" || !chainable {
            return cx.reject(node, untranslatable);
        }
        let n = letters.len();
        for (i, letter) in letters.chars().enumerate() {
            let iname = if i == 0 {
                input.to_string()
            } else {
                format!("{}{}", input, i)
            };
            let oname = if i + 1 == n {
                output.to_string()
            } else {
                format!("{}{}", input, i + 1)
            };
            emit_reduce(cx, node, mode, &iname, &oname, &letter.to_string(), i + 1 == n)?;
        }
    }

    if let Some(m) = mapping {
        cx.set_mapping(output, rules::reduced(&m, &axes, keepdims));
    }
    Ok(())
}

fn emit_argmax(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    input: &str,
    output: &str,
    letter: &str,
) -> ConvertResult<()> {
    let mut source = input.to_string();
    if node.op_type == "ArgMin" {
        source = format!("{}_multiply_minus_1", input);
        cx.emit1(
            &format!("{}_multiply_minus_1", node.name),
            input,
            &source,
            LayerKind::elementwise(ElementwiseMode::Multiply, Some(-1.0)),
        )?;
    }
    cx.emit1(
        &node.name,
        &source,
        output,
        LayerKind::Reduce {
            axis: letter.to_string(),
            mode: ReduceMode::Argmax,
            epsilon: 1e-6,
        },
    )
}

/// `ArgMax`, and `ArgMin` as the argmax of the negated input
pub(super) fn argmax(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 0);
    let keepdims = node.attrs.int_or("keepdims", 1) != 0;
    let input = node.first_input();
    let output = node.first_output();
    let mapping = cx.mapping(input);

    match &mapping {
        Some(m) => match layout!(cx, node, slot_of(m, axis)) {
            Axis::Batch => return cx.reject(node, "Cannot apply operation along Batch axis"),
            Axis::Sequence => {
                let inputs = vec![input.to_string()];
                cx.with_transpose(node, &inputs, &node.outputs, [1, 0, 2, 3], |cx, i, o| {
                    emit_argmax(cx, node, &i[0], &o[0], "C")
                })?;
            }
            slot => emit_argmax(cx, node, input, output, &slot.letter().to_string())?,
        },
        None => {
            let letters = cx
                .graph
                .rank(input)
                .and_then(|rank| {
                    let a = normalize_axis(axis, rank).ok()?;
                    Some(fallback_axis_letters(rank, &[a]))
                })
                .unwrap_or_default();
            if !NATIVE_REDUCE_AXES.contains(&letters.as_str()) {
                return cx.reject(
                    node,
                    format!(
                        "Unable to translate axes attribute to CoreML axis parameter for {}",
                        axis
                    ),
                );
            }
            emit_argmax(cx, node, input, output, &letters)?;
        }
    }

    if let Some(m) = mapping {
        let out = if keepdims {
            m
        } else {
            let drop = normalize_axis(axis, m.len()).ok();
            m.iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != drop)
                .map(|(_, a)| *a)
                .collect()
        };
        cx.set_mapping(output, out);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis::*;
    use crate::builder::{NeuralNetworkSpec, SpecBuilder};
    use crate::error::ConvertError;
    use crate::graph::{AttrValue, Graph};
    use crate::lowering::test_util::{graph, spec};
    use crate::lowering::{Dialect, ErrorHandler, LoweringFn};
    use smallvec::smallvec;

    fn run(
        node: &Node,
        shape: &[i64],
        mapping: Option<AxisMapping>,
        f: LoweringFn,
    ) -> (NeuralNetworkSpec, Graph, ConvertResult<()>) {
        let mut g = graph(vec![node.clone()], shape);
        if let Some(m) = mapping {
            g.axis_map.insert("x", m);
        }
        let mut s = spec(2);
        let mut err = ErrorHandler::new(false, Dialect::Legacy);
        let result = {
            let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
            f(&mut cx, node)
        };
        (s, g, result)
    }

    fn names(s: &NeuralNetworkSpec) -> Vec<&str> {
        s.layers().iter().map(|l| l.name.as_str()).collect()
    }

    fn bchw() -> Option<AxisMapping> {
        Some(smallvec![Batch, Channel, Height, Width])
    }

    #[test]
    fn test_reshape_all_ones_is_flatten() {
        let node = Node::new("r", "Reshape", &["x"], &["y"])
            .with_attr("shape", AttrValue::Ints(vec![1, -1]));
        let (s, g, r) = run(&node, &[1, 3, 4, 4], bchw(), reshape);
        r.unwrap();
        assert!(matches!(s.layers()[0].kind, LayerKind::Flatten { .. }));
        assert_eq!(g.axis_map.get("y"), Some(&[Batch, Channel][..]));
    }

    #[test]
    fn test_reshape_needs_static_target() {
        let node = Node::new("r", "Reshape", &["x", "shape"], &["y"]);
        let (_, _, r) = run(&node, &[1, 3, 4, 4], bchw(), reshape);
        assert!(matches!(r, Err(ConvertError::MissingInitializer { .. })));

        let node = Node::new("r", "Reshape", &["x"], &["y"])
            .with_attr("shape", AttrValue::Ints(vec![3, 4, 4]));
        let (s, g, r) = run(&node, &[1, 3, 4, 4], bchw(), reshape);
        r.unwrap();
        assert!(matches!(
            &s.layers()[0].kind,
            LayerKind::Reshape { target_shape, .. } if target_shape == &vec![1, 3, 4, 4]
        ));
        assert_eq!(g.axis_map.get("y"), Some(&[Channel, Height, Width][..]));
    }

    #[test]
    fn test_concat_along_height_is_wrapped() {
        let node = Node::new("cat", "Concat", &["x", "x"], &["y"])
            .with_attr("axis", AttrValue::Int(2));
        let (s, _, r) = run(&node, &[1, 3, 4, 4], bchw(), concat);
        r.unwrap();
        assert_eq!(
            names(&s),
            vec!["cat_input_transpose0", "cat_input_transpose1", "cat", "cat_output_transpose0"]
        );
    }

    #[test]
    fn test_concat_along_batch_rejected() {
        let node = Node::new("cat", "Concat", &["x", "x"], &["y"])
            .with_attr("axis", AttrValue::Int(0));
        let (_, _, r) = run(&node, &[1, 3, 4, 4], bchw(), concat);
        match r {
            Err(ConvertError::UnsupportedConfiguration { reason, .. }) => {
                assert!(reason.contains("batch axis"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_maps_every_output() {
        let node = Node::new("sp", "Split", &["x"], &["a", "b", "c"])
            .with_attr("axis", AttrValue::Int(1));
        let (s, g, r) = run(&node, &[1, 3, 4, 4], bchw(), split);
        r.unwrap();
        assert!(matches!(s.layers()[0].kind, LayerKind::Split { n_outputs: 3 }));
        for out in ["a", "b", "c"] {
            assert_eq!(g.axis_map.get(out).map(<[Axis]>::len), Some(4));
        }

        let node = Node::new("sp", "Split", &["x"], &["a", "b"])
            .with_attr("split", AttrValue::Ints(vec![1, 2]));
        let (_, _, r) = run(&node, &[1, 3, 4, 4], bchw(), split);
        assert!(r.is_err());
    }

    #[test]
    fn test_slice_chains_axes() {
        let node = Node::new("sl", "Slice", &["x"], &["y"])
            .with_attr("starts", AttrValue::Ints(vec![0, 1]))
            .with_attr("ends", AttrValue::Ints(vec![2, 3]))
            .with_attr("axes", AttrValue::Ints(vec![2, 3]));
        let (s, _, r) = run(&node, &[1, 3, 4, 4], bchw(), slice);
        r.unwrap();
        assert_eq!(names(&s), vec!["sl_x1", "sl_y"]);
        assert_eq!(s.layers()[0].inputs, vec!["x"]);
        assert_eq!(s.layers()[1].inputs, vec!["x1"]);
        assert!(matches!(s.layers()[1].kind, LayerKind::Slice { axis: SliceAxis::Width, start: 1, end: 3, .. }));
    }

    #[test]
    fn test_slice_open_end_uses_dim() {
        let node = Node::new("sl", "Slice", &["x"], &["y"])
            .with_attr("starts", AttrValue::Ints(vec![1]))
            .with_attr("ends", AttrValue::Ints(vec![i64::MAX]))
            .with_attr("axes", AttrValue::Ints(vec![3]));
        let (s, _, r) = run(&node, &[1, 3, 4, 8], None, slice);
        r.unwrap();
        assert!(matches!(s.layers()[0].kind, LayerKind::Slice { axis: SliceAxis::Width, end: 8, .. }));
    }

    #[test]
    fn test_reduce_native_and_chained() {
        let node = Node::new("r", "ReduceSum", &["x"], &["y"])
            .with_attr("axes", AttrValue::Ints(vec![2, 3]))
            .with_attr("keepdims", AttrValue::Int(0));
        let (s, g, r) = run(&node, &[1, 3, 4, 4], bchw(), reduce);
        r.unwrap();
        assert_eq!(names(&s), vec!["r_y"]);
        assert_eq!(g.axis_map.get("y"), Some(&[Batch, Channel][..]));

        let node = Node::new("r", "ReduceMax", &["x"], &["y"])
            .with_attr("axes", AttrValue::Ints(vec![1, 2]));
        let (s, _, r) = run(&node, &[1, 3, 4, 4], bchw(), reduce);
        r.unwrap();
        assert_eq!(names(&s), vec!["r_x1", "r_y"]);

        let node = Node::new("r", "ReduceMean", &["x"], &["y"])
            .with_attr("axes", AttrValue::Ints(vec![1, 2]));
        let (_, _, r) = run(&node, &[1, 3, 4, 4], bchw(), reduce);
        assert!(r.is_err());
    }

    #[test]
    fn test_reduce_log_sum_appends_log() {
        let node = Node::new("r", "ReduceLogSum", &["x"], &["y"])
            .with_attr("axes", AttrValue::Ints(vec![1]));
        let (s, _, r) = run(&node, &[1, 3, 4, 4], bchw(), reduce);
        r.unwrap();
        assert_eq!(names(&s), vec!["r_y_before_log", "r_log"]);
    }

    #[test]
    fn test_argmin_on_sequence_axis() {
        let node = Node::new("am", "ArgMin", &["x"], &["y"]);
        let (s, _, r) = run(&node, &[5, 3], Some(smallvec![Sequence, Channel]), argmax);
        r.unwrap();
        assert_eq!(
            names(&s),
            vec![
                "am_input_transpose0",
                "am_multiply_minus_1",
                "am",
                "am_output_transpose0"
            ]
        );
    }
}
