//! Matrix products and recurrent layers

use ndarray::{ArrayD, IxDyn};
use tracing::warn;

use super::load_constant;
use crate::builder::{BinaryOp, LayerKind, RecurrentActivation, RecurrentWeights, WeightParams};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::legacy::dense::{add_values, flat_blocks, row_blocks};
use crate::lowering::LoweringCx;
use crate::tensor::{scalar, Tensor};

/// Rank the recurrent layers run at
const SEQUENCE_RANK: usize = 5;

// ============================================================================
// Gemm and MatMul
// ============================================================================

fn is_unit(v: f32) -> bool {
    (v - 1.0).abs() <= f32::EPSILON
}

/// `alpha * op(A) * op(B) + beta * C` as a batched matmul
///
/// Constant `B` (with constant or absent `C`) is folded into the layer's
/// weights; otherwise the product and the bias add are separate layers.
pub(super) fn gemm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let attrs = &node.attrs;
    let alpha = attrs.float_or("alpha", 1.0);
    let beta = attrs.float_or("beta", 1.0);
    let transpose_a = attrs.int_or("transA", 0) != 0;
    let transpose_b = attrs.int_or("transB", 0) != 0;
    let output = node.first_output();

    let mut a = node.first_input().to_string();
    if let Some(value) = node.input_tensor(0) {
        let loaded = format!("const_{}", a);
        load_constant(cx, &format!("{}{}_const", node.name, a), &loaded, value)?;
        a = loaded;
    }
    if !is_unit(alpha) {
        let factor = format!("alpha_for_{}", a);
        load_constant(cx, &format!("{}_load_alpha", node.name), &factor, &scalar(alpha))?;
        let scaled = format!("{}_alphaA", a);
        cx.emit(
            &format!("{}_alphaA", node.name),
            &[a.as_str(), factor.as_str()],
            &[scaled.as_str()],
            LayerKind::Broadcastable {
                op: BinaryOp::Multiply,
            },
        )?;
        a = scaled;
    }

    let b = node.inputs.get(1).map_or("", String::as_str);
    let c = node.input(2);
    let folded_b = node.input_tensor(1).filter(|t| t.ndim() == 2);
    let c_value = c.and_then(|_| node.input_tensor(2));

    if let Some(weight) = folded_b {
        if c.is_none() || c_value.is_some() {
            let weight = if transpose_b {
                weight.t().to_owned()
            } else {
                weight.clone()
            };
            let bias = c_value
                .map(|t| WeightParams::from_values(t.iter().map(|v| v * beta).collect()));
            return cx.emit1(
                &node.name,
                &a,
                output,
                LayerKind::BatchedMatMul {
                    transpose_a,
                    transpose_b: false,
                    weight_rows: weight.shape()[0],
                    weight_columns: weight.shape()[1],
                    weights: Some(WeightParams::from(&weight)),
                    bias,
                },
            );
        }
    }

    for i in [1, 2] {
        if let Some(value) = node.input_tensor(i) {
            let layer = format!("{}_load_constant_{}", node.name, i);
            load_constant(cx, &layer, &node.inputs[i], value)?;
        }
    }

    let Some(c) = c else {
        return cx.emit(
            &node.name,
            &[a.as_str(), b],
            &[output],
            product(transpose_a, transpose_b),
        );
    };
    let mut c = c.to_string();
    if !is_unit(beta) {
        let factor = format!("beta_for_{}", b);
        load_constant(cx, &format!("{}_load_beta", node.name), &factor, &scalar(beta))?;
        let scaled = format!("{}_betaC", c);
        cx.emit(
            &format!("{}_betaC", node.name),
            &[c.as_str(), factor.as_str()],
            &[scaled.as_str()],
            LayerKind::Broadcastable {
                op: BinaryOp::Multiply,
            },
        )?;
        c = scaled;
    }
    let product_out = format!("{}_b_mat_mul", output);
    cx.emit(
        &node.name,
        &[a.as_str(), b],
        &[product_out.as_str()],
        product(transpose_a, transpose_b),
    )?;
    cx.emit(
        &format!("{}_add_bias", node.name),
        &[product_out.as_str(), c.as_str()],
        &[output],
        LayerKind::Broadcastable { op: BinaryOp::Add },
    )
}

/// Two-input batched matmul
fn product(transpose_a: bool, transpose_b: bool) -> LayerKind {
    LayerKind::BatchedMatMul {
        transpose_a,
        transpose_b,
        weights: None,
        bias: None,
        weight_rows: 0,
        weight_columns: 0,
    }
}

/// Rank-2 constant weights become layer parameters; other constants are
/// loaded and multiplied as a second input
pub(super) fn matmul(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let weight_edge = node.inputs.get(1).map_or("", String::as_str);
    match node.input_tensor(1) {
        Some(w) if w.ndim() == 2 => {
            return cx.emit1(
                &node.name,
                node.first_input(),
                node.first_output(),
                LayerKind::BatchedMatMul {
                    transpose_a: false,
                    transpose_b: false,
                    weights: Some(WeightParams::from(w)),
                    bias: None,
                    weight_rows: w.shape()[0],
                    weight_columns: w.shape()[1],
                },
            );
        }
        Some(w) => {
            let layer = format!("{}_const_weight_input", node.name);
            load_constant(cx, &layer, weight_edge, w)?;
        }
        None => {}
    }
    cx.emit(
        &node.name,
        &[node.first_input(), weight_edge],
        &[node.first_output()],
        product(false, false),
    )
}

// ============================================================================
// Recurrent layers
// ============================================================================

fn recurrent_activation(name: &str) -> Option<RecurrentActivation> {
    let activation = match name.to_ascii_uppercase().as_str() {
        "SIGMOID" => RecurrentActivation::Sigmoid,
        "TANH" => RecurrentActivation::Tanh,
        "RELU" => RecurrentActivation::Relu,
        "HARDSIGMOID" | "SIGMOID_HARD" => RecurrentActivation::SigmoidHard,
        "AFFINE" | "LINEAR" => RecurrentActivation::Linear,
        _ => return None,
    };
    Some(activation)
}

/// Leading entries of `activations`, one per default; `defaults` when absent
fn activations(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    defaults: &[RecurrentActivation],
) -> ConvertResult<Option<Vec<RecurrentActivation>>> {
    if node.attrs.contains("activation_alpha") || node.attrs.contains("activation_beta") {
        warn!(node = %node.name, "activation alpha and beta are not used");
    }
    let Some(names) = node.attrs.strings("activations") else {
        return Ok(Some(defaults.to_vec()));
    };
    if names.len() < defaults.len() {
        cx.reject(node, "Error in ONNX model: Less number of activations provided")?;
        return Ok(None);
    }
    if names.len() == 2 * defaults.len() {
        warn!(node = %node.name, "forward and backward pass will use same activations");
    }
    let mut parsed = Vec::with_capacity(defaults.len());
    for name in &names[..defaults.len()] {
        match recurrent_activation(name) {
            Some(a) => parsed.push(a),
            None => {
                cx.reject(node, format!("Activation {} not supported for recurrent layers", name))?;
                return Ok(None);
            }
        }
    }
    Ok(Some(parsed))
}

/// Named state edge: the node's own if present, else a derived name
fn state_edge(edges: &[String], i: usize, base: &str, suffix: &str) -> String {
    edges
        .get(i)
        .filter(|e| !e.is_empty())
        .cloned()
        .unwrap_or_else(|| format!("{}{}", base, suffix))
}

/// Zero initial state of shape `[dirs, batch, hidden]` for a missing state input
fn zero_state(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    layer: &str,
    edge: &str,
    dirs: usize,
    hidden_size: usize,
) -> ConvertResult<bool> {
    let batch = cx
        .shape(node.first_input())
        .and_then(|s| s.get(1).copied())
        .filter(|&b| b > 0);
    let Some(batch) = batch else {
        cx.reject(node, "Input shape not represented within Graph")?;
        return Ok(false);
    };
    let zeros: Tensor = ArrayD::zeros(IxDyn(&[dirs, batch as usize, hidden_size]));
    load_constant(cx, layer, edge, &zeros)?;
    Ok(true)
}

/// Expand `edge` from `rank` to rank 5 in one layer
fn expand_to_sequence_rank(
    cx: &mut LoweringCx<'_>,
    layer: &str,
    edge: &str,
    expanded: String,
    rank: usize,
) -> ConvertResult<String> {
    if rank >= SEQUENCE_RANK {
        return Ok(edge.to_string());
    }
    let axes = (rank..SEQUENCE_RANK).map(|a| a as i64).collect();
    cx.emit1(layer, edge, &expanded, LayerKind::ExpandDims { axes })?;
    Ok(expanded)
}

/// Rank of the sequence input, or a rejection
fn sequence_rank(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<Option<usize>> {
    match cx.rank(node.first_input()) {
        Some(rank) if rank <= SEQUENCE_RANK => Ok(Some(rank)),
        Some(rank) => {
            cx.reject(node, format!("Recurrent input of rank {} not supported", rank))?;
            Ok(None)
        }
        None => {
            cx.reject(node, "Rank unknown for input")?;
            Ok(None)
        }
    }
}

/// `[seq, batch, dirs * hidden, 1, 1]` back to `[seq, dirs, batch, hidden]`
/// and rank-3 states
fn unpack_sequence(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    dirs: usize,
    states: &[(&str, &str)],
) -> ConvertResult<()> {
    let output = node.first_output();
    let raw = format!("{}_5d_out", output);
    let reshaped = format!("{}_5d_reshaped", output);
    let squeezed = format!("{}_4d", output);
    cx.emit1(
        &format!("{}_reshape_", node.name),
        &raw,
        &reshaped,
        LayerKind::RankPreservingReshape {
            target_shape: vec![0, 0, dirs as i64, -1, 0],
        },
    )?;
    cx.emit1(
        &format!("{}_squeeze_out", node.name),
        &reshaped,
        &squeezed,
        LayerKind::Squeeze {
            axes: Some(vec![-1]),
        },
    )?;
    cx.emit1(
        &format!("{}_transpose", node.name),
        &squeezed,
        output,
        LayerKind::Transpose {
            axes: vec![0, 2, 1, 3],
        },
    )?;
    for (suffix, state) in states {
        cx.emit1(
            &format!("{}_squeeze_out_{}", node.name, suffix),
            &format!("{}_5d", state),
            state,
            LayerKind::Squeeze {
                axes: Some(vec![-1, -2]),
            },
        )?;
    }
    Ok(())
}

/// Gate weights of one LSTM direction, reordered from `i, o, f, c` to
/// `i, f, o, c`
fn lstm_direction(
    w: &[WeightParams],
    r: &[WeightParams],
    b: Option<&[WeightParams]>,
    p: Option<&[WeightParams]>,
) -> RecurrentWeights {
    let reorder = |blocks: &[WeightParams]| {
        vec![blocks[0].clone(), blocks[2].clone(), blocks[1].clone(), blocks[3].clone()]
    };
    RecurrentWeights {
        w_x: reorder(w),
        w_h: reorder(r),
        bias: b.map(|b| {
            [(0, 4), (2, 6), (1, 5), (3, 7)]
                .iter()
                .map(|&(wi, ri)| add_values(&b[wi], &b[ri]))
                .collect()
        }),
        peephole: p.map(|p| vec![p[0].clone(), p[2].clone(), p[1].clone()]),
    }
}

/// Forward, reverse or bidirectional LSTM at rank 5
///
/// Missing initial states start at zero, with the cell state sharing the
/// hidden state's blob. Bidirectional states are split per direction and
/// concatenated back after the layer.
pub(super) fn lstm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    use RecurrentActivation::{Sigmoid, Tanh};
    let Some(acts) = activations(cx, node, &[Sigmoid, Tanh, Tanh])? else {
        return Ok(());
    };
    let direction = node.attrs.string_or("direction", "forward");
    let dirs = if direction == "bidirectional" { 2 } else { 1 };
    let clip = node.attrs.float_or("clip", 500_000.0);
    if node.attrs.int_or("input_forget", 0) != 0 {
        warn!(node = %node.name, "coupled input and forget gates are not supported, ignoring");
    }

    let edge = |i: usize| node.inputs.get(i).map_or("", String::as_str);
    let w = cx.require_const(
        node,
        1,
        &format!("Weight tensor: {} not found in the graph initializer", edge(1)),
    )?;
    let r = cx.require_const(
        node,
        2,
        &format!("Weight tensor: {} not found in the graph initializer", edge(2)),
    )?;
    let (Some(w_blocks), Some(r_blocks)) = (row_blocks(&w, 4 * dirs), row_blocks(&r, 4 * dirs))
    else {
        return cx.reject(node, "LSTM weights must hold four gate blocks per direction");
    };
    let b_blocks = match node.input(3).and_then(|_| node.input_tensor(3)) {
        Some(b) => match flat_blocks(b, 8 * dirs) {
            Some(blocks) => Some(blocks),
            None => return cx.reject(node, "LSTM bias must hold eight gate blocks per direction"),
        },
        None => None,
    };
    let p_blocks = node
        .input(7)
        .and_then(|_| node.input_tensor(7))
        .and_then(|p| flat_blocks(p, 3 * dirs));

    let hidden_size = node
        .attrs
        .int("hidden_size")
        .map_or(w_blocks[0].shape[0], |h| h as usize);
    let input_size = w_blocks[0].shape.get(1).copied().unwrap_or(1);
    let per_dir = |d: usize| {
        lstm_direction(
            &w_blocks[4 * d..4 * d + 4],
            &r_blocks[4 * d..4 * d + 4],
            b_blocks.as_deref().map(|b| &b[8 * d..8 * d + 8]),
            p_blocks.as_deref().map(|p| &p[3 * d..3 * d + 3]),
        )
    };

    let input = node.first_input();
    let output = node.first_output();
    let mut input_h = state_edge(&node.inputs, 5, input, "_h_input");
    let mut input_c = state_edge(&node.inputs, 6, input, "_c_input");
    let output_h = state_edge(&node.outputs, 1, output, "_h_output");
    let output_c = state_edge(&node.outputs, 2, output, "_c_output");

    for i in [5, 6] {
        if let (Some(e), Some(value)) = (node.input(i), node.input_tensor(i)) {
            let e = e.to_string();
            load_constant(cx, &format!("{}_load_constant_{}", node.name, i), &e, value)?;
        }
    }
    if node.input(5).is_none() {
        let layer = format!("{}_load_initial_h_and_c", node.name);
        if !zero_state(cx, node, &layer, &input_h, dirs, hidden_size)? {
            return Ok(());
        }
        if node.input(6).is_none() {
            input_c = input_h.clone();
        }
    } else if node.input(6).is_none() {
        let layer = format!("{}_load_initial_c", node.name);
        if !zero_state(cx, node, &layer, &input_c, dirs, hidden_size)? {
            return Ok(());
        }
    }

    let Some(rank) = sequence_rank(cx, node)? else {
        return Ok(());
    };
    let shared_state = input_h == input_c;
    let x5 = expand_to_sequence_rank(
        cx,
        &format!("{}_expand_in_0", node.name),
        input,
        format!("{}_expand_out_0", input),
        rank,
    )?;
    let h5 = expand_to_sequence_rank(
        cx,
        &format!("{}_expand_in_h_0", node.name),
        &input_h,
        format!("{}_expand_out_h_0", input_h),
        rank,
    )?;
    input_h = h5;
    input_c = if shared_state {
        input_h.clone()
    } else {
        expand_to_sequence_rank(
            cx,
            &format!("{}_expand_in_c_0", node.name),
            &input_c,
            format!("{}_expand_out_c_0", input_c),
            rank,
        )?
    };

    let raw = format!("{}_5d_out", output);
    let output_h5 = format!("{}_5d", output_h);
    let output_c5 = format!("{}_5d", output_c);

    if dirs == 1 {
        cx.emit(
            &node.name,
            &[x5.as_str(), input_h.as_str(), input_c.as_str()],
            &[raw.as_str(), output_h5.as_str(), output_c5.as_str()],
            LayerKind::UniLstm {
                hidden_size,
                input_size,
                weights: per_dir(0),
                activations: acts,
                output_all: true,
                forget_bias: true,
                cell_clip: Some(clip),
                reverse_input: direction == "reverse",
            },
        )?;
    } else {
        let split = |edge: &str| [format!("{}_f", edge), format!("{}_b", edge)];
        let [h_f, h_b] = split(&input_h);
        cx.emit(
            &format!("{}_split_h", node.name),
            &[input_h.as_str()],
            &[h_f.as_str(), h_b.as_str()],
            split_halves(),
        )?;
        let [c_f, c_b] = if shared_state {
            [h_f.clone(), h_b.clone()]
        } else {
            let halves = split(&input_c);
            cx.emit(
                &format!("{}_split_c", node.name),
                &[input_c.as_str()],
                &[halves[0].as_str(), halves[1].as_str()],
                split_halves(),
            )?;
            halves
        };
        let [oh_f, oh_b] = split(&output_h);
        let [oc_f, oc_b] = split(&output_c);
        cx.emit(
            &node.name,
            &[x5.as_str(), h_f.as_str(), c_f.as_str(), h_b.as_str(), c_b.as_str()],
            &[raw.as_str(), oh_f.as_str(), oc_f.as_str(), oh_b.as_str(), oc_b.as_str()],
            LayerKind::BiDirLstm {
                hidden_size,
                input_size,
                forward: per_dir(0),
                backward: per_dir(1),
                activations: acts,
                output_all: true,
                forget_bias: true,
                cell_clip: Some(clip),
            },
        )?;
        cx.emit(
            &format!("{}concat_output_h", node.name),
            &[oh_f.as_str(), oh_b.as_str()],
            &[output_h5.as_str()],
            LayerKind::ConcatNd { axis: 0 },
        )?;
        cx.emit(
            &format!("{}concat_output_c", node.name),
            &[oc_f.as_str(), oc_b.as_str()],
            &[output_c5.as_str()],
            LayerKind::ConcatNd { axis: 0 },
        )?;
    }

    unpack_sequence(cx, node, dirs, &[("h", output_h.as_str()), ("c", output_c.as_str())])
}

fn split_halves() -> LayerKind {
    LayerKind::SplitNd {
        axis: 0,
        num_splits: 2,
        split_sizes: vec![],
    }
}

/// Forward or reverse GRU at rank 5 with constant weights
pub(super) fn gru(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    use RecurrentActivation::{Sigmoid, Tanh};
    let Some(acts) = activations(cx, node, &[Sigmoid, Tanh])? else {
        return Ok(());
    };
    let direction = node.attrs.string_or("direction", "forward");
    if direction == "bidirectional" {
        return cx.reject(
            node,
            "Bidirectional GRU not supported!! Please consider adding custom conversion function/layer",
        );
    }
    let (Some(w), Some(r)) = (node.input_tensor(1), node.input_tensor(2)) else {
        return cx.reject(
            node,
            "Input and Recursion weights must be known!! Please consider adding custom conversion function/layer",
        );
    };
    let (Some(w_x), Some(w_h)) = (row_blocks(w, 3), row_blocks(r, 3)) else {
        return cx.reject(node, "GRU weights must hold three gate blocks");
    };
    let bias = match node.input(3).and_then(|_| node.input_tensor(3)) {
        Some(b) => match flat_blocks(b, 6) {
            Some(b) => Some((0..3).map(|g| add_values(&b[g], &b[g + 3])).collect()),
            None => return cx.reject(node, "GRU bias must hold six gate blocks"),
        },
        None => None,
    };
    let hidden_size = node
        .attrs
        .int("hidden_size")
        .map_or(w_x[0].shape[0], |h| h as usize);
    let input_size = w_x[0].shape.get(1).copied().unwrap_or(1);

    let input = node.first_input();
    let output = node.first_output();
    let input_h = state_edge(&node.inputs, 5, input, "_h_input");
    let output_h = state_edge(&node.outputs, 1, output, "_h_output");
    match (node.input(5), node.input_tensor(5)) {
        (Some(_), Some(value)) => {
            load_constant(cx, &format!("{}_load_constant_5", node.name), &input_h, value)?;
        }
        (Some(_), None) => {}
        (None, _) => {
            let layer = format!("{}_load_initial_h", node.name);
            if !zero_state(cx, node, &layer, &input_h, 1, hidden_size)? {
                return Ok(());
            }
        }
    }

    let Some(rank) = sequence_rank(cx, node)? else {
        return Ok(());
    };
    let x5 = expand_to_sequence_rank(
        cx,
        &format!("{}_expand_in_0", node.name),
        input,
        format!("{}_expand_out_0", input),
        rank,
    )?;
    let h5 = expand_to_sequence_rank(
        cx,
        &format!("{}_expand_in_h_0", node.name),
        &input_h,
        format!("{}_expand_out_h_0", input_h),
        rank,
    )?;

    let raw = format!("{}_5d_out", output);
    let output_h5 = format!("{}_5d", output_h);
    cx.emit(
        &node.name,
        &[x5.as_str(), h5.as_str()],
        &[raw.as_str(), output_h5.as_str()],
        LayerKind::Gru {
            hidden_size,
            input_size,
            weights: RecurrentWeights {
                w_x,
                w_h,
                bias,
                peephole: None,
            },
            inner_activation: acts[0],
            activation: acts[1],
            output_all: true,
            reverse_input: direction == "reverse",
        },
    )?;
    unpack_sequence(cx, node, 1, &[("h", output_h.as_str())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{NeuralNetworkSpec, SpecBuilder};
    use crate::error::ConvertError;
    use crate::graph::AttrValue;
    use crate::lowering::test_util::{graph, spec_with};
    use crate::lowering::{Dialect, ErrorHandler, LoweringFn};
    use crate::tensor::tensor_from_vec;

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

    fn iota(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        tensor_from_vec(shape, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    fn names(s: &NeuralNetworkSpec) -> Vec<&str> {
        s.layers().iter().map(|l| l.name.as_str()).collect()
    }

    #[test]
    fn test_gemm_folds_constant_operands() {
        let node = Node::new("fc", "Gemm", &["x", "w", "c"], &["y"])
            .with_attr("transB", AttrValue::Int(1))
            .with_attr("beta", AttrValue::Float(2.0))
            .with_tensor("w", iota(&[4, 3]))
            .with_tensor("c", iota(&[4]));
        let (s, r) = run(&node, &[1, 3], gemm);
        r.unwrap();
        assert_eq!(s.layers().len(), 1);
        match &s.layers()[0].kind {
            LayerKind::BatchedMatMul {
                weights,
                bias,
                weight_rows,
                weight_columns,
                ..
            } => {
                assert_eq!((*weight_rows, *weight_columns), (3, 4));
                assert_eq!(weights.as_ref().unwrap().values[..4], [0.0, 3.0, 6.0, 9.0]);
                assert_eq!(bias.as_ref().unwrap().values, vec![0.0, 2.0, 4.0, 6.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gemm_dynamic_operands_scale_separately() {
        let node = Node::new("fc", "Gemm", &["x", "w", "c"], &["y"])
            .with_attr("alpha", AttrValue::Float(0.5))
            .with_attr("beta", AttrValue::Float(2.0));
        let (s, r) = run(&node, &[2, 3], gemm);
        r.unwrap();
        assert_eq!(
            names(&s),
            vec!["fc_load_alpha", "fc_alphaA", "fc_load_beta", "fc_betaC", "fc", "fc_add_bias"]
        );
        assert_eq!(s.layers()[4].inputs, vec!["x_alphaA", "w"]);
        assert_eq!(s.layers()[4].outputs, vec!["y_b_mat_mul"]);
        assert_eq!(s.layers()[5].inputs, vec!["y_b_mat_mul", "c_betaC"]);
    }

    #[test]
    fn test_matmul_weight_placement() {
        let node = Node::new("mm", "MatMul", &["x", "w"], &["y"]).with_tensor("w", iota(&[3, 2]));
        let (s, r) = run(&node, &[4, 3], matmul);
        r.unwrap();
        assert_eq!(s.layers()[0].inputs, vec!["x"]);

        let node = Node::new("mm", "MatMul", &["x", "w"], &["y"]).with_tensor("w", iota(&[2, 3, 2]));
        let (s, r) = run(&node, &[2, 4, 3], matmul);
        r.unwrap();
        assert_eq!(names(&s), vec!["mm_const_weight_input", "mm"]);
        assert_eq!(s.layers()[1].inputs, vec!["x", "w"]);
    }

    #[test]
    fn test_lstm_forward_layers() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r", "b"], &["y"])
            .with_attr("hidden_size", AttrValue::Int(1))
            .with_tensor("w", iota(&[1, 4, 2]))
            .with_tensor("r", iota(&[1, 4, 1]))
            .with_tensor("b", iota(&[1, 8]));
        let (s, r) = run(&node, &[5, 1, 2], lstm);
        r.unwrap();
        assert_eq!(
            names(&s),
            vec![
                "lstm_load_initial_h_and_c",
                "lstm_expand_in_0",
                "lstm_expand_in_h_0",
                "lstm",
                "lstm_reshape_",
                "lstm_squeeze_out",
                "lstm_transpose",
                "lstm_squeeze_out_h",
                "lstm_squeeze_out_c",
            ]
        );
        let layer = &s.layers()[3];
        assert_eq!(
            layer.inputs,
            vec!["x_expand_out_0", "x_h_input_expand_out_h_0", "x_h_input_expand_out_h_0"]
        );
        match &layer.kind {
            LayerKind::UniLstm {
                forget_bias,
                cell_clip,
                weights,
                ..
            } => {
                assert!(*forget_bias);
                assert_eq!(*cell_clip, Some(500_000.0));
                let b: Vec<f32> = weights.bias.as_ref().unwrap().iter().map(|b| b.values[0]).collect();
                assert_eq!(b, vec![4.0, 8.0, 6.0, 10.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.layers()[1].kind, LayerKind::ExpandDims { axes: vec![3, 4] });
        assert_eq!(s.rank("y"), Some(4));
    }

    #[test]
    fn test_lstm_bidirectional_splits_state() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r"], &["y", "yh", "yc"])
            .with_attr("direction", AttrValue::String("bidirectional".into()))
            .with_tensor("w", iota(&[2, 8, 2]))
            .with_tensor("r", iota(&[2, 8, 2]));
        let (s, r) = run(&node, &[5, 1, 2], lstm);
        r.unwrap();
        let layer = s.layer("lstm").unwrap();
        assert_eq!(layer.inputs.len(), 5);
        assert_eq!(layer.outputs[1], "yh_f");
        assert!(matches!(layer.kind, LayerKind::BiDirLstm { hidden_size: 2, .. }));
        assert!(s.layer("lstm_split_h").is_some());
        assert!(s.layer("lstm_split_c").is_none());
        assert!(s.layer("lstmconcat_output_c").is_some());
        assert_eq!(
            s.layer("lstm_reshape_").unwrap().kind,
            LayerKind::RankPreservingReshape {
                target_shape: vec![0, 0, 2, -1, 0]
            }
        );
    }

    #[test]
    fn test_lstm_too_few_activations() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r"], &["y"])
            .with_attr("activations", AttrValue::Strings(vec!["Sigmoid".into()]))
            .with_tensor("w", iota(&[1, 4, 2]))
            .with_tensor("r", iota(&[1, 4, 1]));
        let (_, r) = run(&node, &[5, 1, 2], lstm);
        assert!(r.unwrap_err().to_string().contains("Less number of activations"));
    }

    #[test]
    fn test_gru_requirements() {
        let node = Node::new("gru", "GRU", &["x", "w", "r"], &["y"])
            .with_attr("direction", AttrValue::String("bidirectional".into()));
        let (_, r) = run(&node, &[5, 1, 2], gru);
        assert!(r.unwrap_err().to_string().contains("Bidirectional GRU"));

        let node = Node::new("gru", "GRU", &["x", "w", "r"], &["y"]).with_tensor("w", iota(&[1, 3, 2]));
        let (_, r) = run(&node, &[5, 1, 2], gru);
        assert!(matches!(r, Err(ConvertError::UnsupportedConfiguration { .. })));
    }

    #[test]
    fn test_gru_reverse() {
        let node = Node::new("gru", "GRU", &["x", "w", "r", "b"], &["y"])
            .with_attr("direction", AttrValue::String("reverse".into()))
            .with_tensor("w", iota(&[1, 3, 2]))
            .with_tensor("r", iota(&[1, 3, 1]))
            .with_tensor("b", iota(&[1, 6]));
        let (s, r) = run(&node, &[5, 1, 2], gru);
        r.unwrap();
        assert_eq!(names(&s)[0], "gru_load_initial_h");
        match &s.layer("gru").unwrap().kind {
            LayerKind::Gru {
                reverse_input,
                weights,
                hidden_size,
                ..
            } => {
                assert!(*reverse_input);
                assert_eq!(*hidden_size, 1);
                let b: Vec<f32> = weights.bias.as_ref().unwrap().iter().map(|b| b.values[0]).collect();
                assert_eq!(b, vec![3.0, 5.0, 7.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.layer("gru_squeeze_out_h").is_some());
    }
}
