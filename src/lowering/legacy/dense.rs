//! Inner products and recurrent layers

use crate::axis::rules::inner_product_layout;
use crate::axis::{Axis, AxisMapping};
use crate::builder::{LayerKind, RecurrentActivation, RecurrentWeights, WeightParams};
use crate::error::ConvertResult;
use crate::graph::{EdgeInfo, Node};
use crate::lowering::LoweringCx;
use crate::proto::onnx::tensor_proto::DataType;
use crate::tensor::Tensor;

const INNER_PRODUCT: &str = "This Gemm layer cannot be converted to CoreML inner_product layer";

// ============================================================================
// Inner product
// ============================================================================

/// Emit `W x + b` with `W` laid out `[out, in]`
fn inner_product(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    weight: &Tensor,
    bias: Option<Vec<f32>>,
) -> ConvertResult<()> {
    let kind = LayerKind::InnerProduct {
        input_channels: weight.shape()[1],
        output_channels: weight.shape()[0],
        weights: WeightParams::from(weight),
        bias: bias.map(WeightParams::from_values),
    };
    let input = node.first_input();
    let perm = match cx.mapping(input) {
        Some(m) => layout!(cx, node, inner_product_layout(&m)),
        None => None,
    };
    match perm {
        Some(perm) => {
            let inputs = vec![input.to_string()];
            cx.with_transpose(node, &inputs, &node.outputs, perm, |cx, i, o| {
                cx.emit1(&node.name, &i[0], &o[0], kind)
            })?;
        }
        None => cx.emit1(&node.name, input, node.first_output(), kind)?,
    }
    cx.keep_mapping(node);
    Ok(())
}

/// `Gemm` with a constant `B`, `transA = 0` and unit `alpha`/`beta`
pub(super) fn gemm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let attrs = &node.attrs;
    if attrs.int_or("transA", 0) != 0 {
        return cx.reject(node, INNER_PRODUCT);
    }
    if (attrs.float_or("alpha", 1.0) - 1.0).abs() > 1e-3
        || (attrs.float_or("beta", 1.0) - 1.0).abs() > 1e-3
    {
        return cx.reject(node, INNER_PRODUCT);
    }
    let weight = cx.require_const(node, 1, "Second input to Gemm layer must be a constant")?;
    if weight.ndim() != 2 {
        return cx.reject(node, INNER_PRODUCT);
    }
    let weight = if attrs.int_or("transB", 0) == 0 {
        weight.t().to_owned()
    } else {
        weight
    };
    let bias = match node.input(2) {
        Some(_) => {
            let b = cx.require_const(node, 2, "Bias input to Gemm layer must be a constant")?;
            Some(b.iter().copied().collect::<Vec<f32>>())
        }
        None => None,
    };
    if bias.as_ref().map_or(false, |b| b.len() != weight.shape()[0]) {
        return cx.reject(node, INNER_PRODUCT);
    }
    inner_product(cx, node, &weight, bias)
}

/// `MatMul` with a constant 2-D right operand
pub(super) fn matmul(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let weight = cx.require_const(node, 1, "Second input to Matmul layer must be a constant")?;
    if weight.ndim() != 2 {
        return cx.reject(
            node,
            "This Matmul layer cannot be converted to CoreML inner_product layer",
        );
    }
    inner_product(cx, node, &weight.t().to_owned(), None)
}

// ============================================================================
// LSTM
// ============================================================================

/// Split the rows of a `[dirs, n * rows, cols]` (or `[n * rows, cols]`) blob into `n` blocks
pub(crate) fn row_blocks(t: &Tensor, n: usize) -> Option<Vec<WeightParams>> {
    let cols = if t.ndim() >= 2 { *t.shape().last()? } else { 1 };
    let total = t.len();
    if cols == 0 || total % (n * cols) != 0 {
        return None;
    }
    let rows = total / cols / n;
    let values: Vec<f32> = t.iter().copied().collect();
    Some(
        values
            .chunks(rows * cols)
            .map(|chunk| WeightParams {
                shape: if t.ndim() >= 2 { vec![rows, cols] } else { vec![rows] },
                values: chunk.to_vec(),
            })
            .collect(),
    )
}

/// Split a blob read as one flat vector into `n` rank-1 blocks
pub(crate) fn flat_blocks(t: &Tensor, n: usize) -> Option<Vec<WeightParams>> {
    if n == 0 || t.len() % n != 0 {
        return None;
    }
    let values: Vec<f32> = t.iter().copied().collect();
    Some(
        values
            .chunks(t.len() / n)
            .map(|chunk| WeightParams::from_values(chunk.to_vec()))
            .collect(),
    )
}

pub(crate) fn add_values(a: &WeightParams, b: &WeightParams) -> WeightParams {
    WeightParams {
        shape: a.shape.clone(),
        values: a.values.iter().zip(&b.values).map(|(x, y)| x + y).collect(),
    }
}

/// Forward LSTM as a unidirectional target LSTM
///
/// ONNX gate blocks come as input, output, forget, cell and are reordered to
/// input, forget, output, cell. Missing state edges get synthesized names and
/// are registered as optional model inputs and outputs.
pub(super) fn lstm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
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

    let (Some(w_blocks), Some(r_blocks)) = (row_blocks(&w, 4), row_blocks(&r, 4)) else {
        return cx.reject(node, "LSTM weights must hold four gate blocks");
    };
    let hidden_size = w_blocks[0].shape[0];
    let input_size = w_blocks[0].shape.get(1).copied().unwrap_or(1);
    let reorder = |b: &[WeightParams]| vec![b[0].clone(), b[2].clone(), b[1].clone(), b[3].clone()];

    let bias = match node.input_tensor(3).map(|b| flat_blocks(b, 8)) {
        Some(Some(b)) => Some(
            [(0, 4), (2, 6), (1, 5), (3, 7)]
                .iter()
                .map(|&(wi, ri)| add_values(&b[wi], &b[ri]))
                .collect(),
        ),
        Some(None) => return cx.reject(node, "LSTM bias must hold eight gate blocks"),
        None => None,
    };

    let first_in = node.first_input();
    let first_out = node.first_output();
    let input_h = node
        .input(5)
        .map_or_else(|| format!("{}_h_input", first_in), str::to_string);
    let input_c = node
        .input(6)
        .map_or_else(|| format!("{}_c_input", first_in), str::to_string);
    let output_h = node
        .outputs
        .get(1)
        .filter(|o| !o.is_empty())
        .cloned()
        .unwrap_or_else(|| format!("{}_h_output", first_out));
    let output_c = node
        .outputs
        .get(2)
        .filter(|o| !o.is_empty())
        .cloned()
        .unwrap_or_else(|| format!("{}_c_output", first_out));

    let state = |name: &str| EdgeInfo::new(name, DataType::Float as i32, vec![hidden_size as i64]);
    for name in [&input_h, &input_c] {
        if !cx.graph.optional_inputs.iter().any(|e| &e.name == name) {
            cx.graph.optional_inputs.push(state(name));
        }
    }
    for name in [&output_h, &output_c] {
        if !cx.graph.optional_outputs.iter().any(|e| &e.name == name) {
            cx.graph.optional_outputs.push(state(name));
        }
    }

    cx.emit(
        &node.name,
        &[first_in, input_h.as_str(), input_c.as_str()],
        &[first_out, output_h.as_str(), output_c.as_str()],
        LayerKind::UniLstm {
            hidden_size,
            input_size,
            weights: RecurrentWeights {
                w_x: reorder(&w_blocks),
                w_h: reorder(&r_blocks),
                bias,
                peephole: None,
            },
            activations: vec![
                RecurrentActivation::Sigmoid,
                RecurrentActivation::Tanh,
                RecurrentActivation::Tanh,
            ],
            output_all: true,
            forget_bias: false,
            cell_clip: Some(50000.0),
            reverse_input: false,
        },
    )?;

    if let Some(m) = cx.mapping(first_in) {
        for (edge, mapping) in recurrent_output_layouts(&m, first_out, &output_h, &output_c) {
            if cx.graph.rank(&edge).map_or(true, |r| r == mapping.len()) {
                cx.set_mapping(&edge, mapping);
            }
        }
    }
    Ok(())
}

/// Output mappings of a rank-5 LSTM fed by an `[S, B, C]` input
///
/// `Y` is `[seq, num_directions, batch, hidden]`; the unit direction dim
/// sits on the layer's unit height. The states are `[num_directions,
/// batch, hidden]` and line up with the input.
fn recurrent_output_layouts(
    input: &AxisMapping,
    output: &str,
    output_h: &str,
    output_c: &str,
) -> Vec<(String, AxisMapping)> {
    if input.len() != 3 || input.contains(&Axis::Height) {
        return Vec::new();
    }
    let mut sequence = input.clone();
    sequence.insert(1, Axis::Height);
    vec![
        (output.to_string(), sequence),
        (output_h.to_string(), input.clone()),
        (output_c.to_string(), input.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis::*;
    use crate::axis::AxisMapping;
    use crate::builder::{NeuralNetworkSpec, SpecBuilder};
    use crate::error::ConvertError;
    use crate::graph::{AttrValue, Graph};
    use crate::lowering::test_util::{graph, spec};
    use crate::lowering::{Dialect, ErrorHandler, LoweringFn};
    use crate::tensor::tensor_from_vec;
    use smallvec::smallvec;

    fn run(
        node: &Node,
        shape: &[i64],
        mapping: AxisMapping,
        f: LoweringFn,
    ) -> (NeuralNetworkSpec, Graph, ConvertResult<()>) {
        let mut g = graph(vec![node.clone()], shape);
        g.axis_map.insert("x", mapping);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(false, Dialect::Legacy);
        let result = {
            let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
            f(&mut cx, node)
        };
        (s, g, result)
    }

    fn iota(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        tensor_from_vec(shape, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_gemm_trans_b_keeps_layout() {
        let node = Node::new("fc", "Gemm", &["x", "w", "b"], &["y"])
            .with_attr("transB", AttrValue::Int(1))
            .with_tensor("w", iota(&[4, 3]))
            .with_tensor("b", iota(&[4]));
        let (s, g, r) = run(&node, &[1, 3], smallvec![Batch, Channel], gemm);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::InnerProduct {
                input_channels,
                output_channels,
                bias,
                ..
            } => {
                assert_eq!((*input_channels, *output_channels), (3, 4));
                assert_eq!(bias.as_ref().map(WeightParams::len), Some(4));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(g.axis_map.get("y"), Some(&[Batch, Channel][..]));
    }

    #[test]
    fn test_gemm_scaled_is_rejected() {
        let node = Node::new("fc", "Gemm", &["x", "w"], &["y"])
            .with_attr("alpha", AttrValue::Float(2.0))
            .with_tensor("w", iota(&[3, 4]));
        let (_, _, r) = run(&node, &[1, 3], smallvec![Batch, Channel], gemm);
        assert!(matches!(r, Err(ConvertError::UnsupportedConfiguration { .. })));
    }

    #[test]
    fn test_matmul_on_hw_is_wrapped() {
        let node = Node::new("mm", "MatMul", &["x", "w"], &["y"]).with_tensor("w", iota(&[3, 2]));
        let (s, _, r) = run(&node, &[4, 3], smallvec![Height, Width], matmul);
        r.unwrap();
        let layers = s.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].kind, LayerKind::Permute { axes: [2, 3, 0, 1] });
        match &layers[1].kind {
            LayerKind::InnerProduct { input_channels, output_channels, weights, .. } => {
                assert_eq!((*input_channels, *output_channels), (3, 2));
                assert_eq!(weights.values, vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lstm_reorders_gates() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r", "b"], &["y"])
            .with_tensor("w", iota(&[1, 4, 2]))
            .with_tensor("r", iota(&[1, 4, 1]))
            .with_tensor("b", iota(&[1, 8]));
        let (s, g, r) = run(&node, &[5, 1, 2], smallvec![Sequence, Batch, Channel], lstm);
        r.unwrap();
        let layer = &s.layers()[0];
        assert_eq!(layer.inputs, vec!["x", "x_h_input", "x_c_input"]);
        assert_eq!(layer.outputs, vec!["y", "y_h_output", "y_c_output"]);
        match &layer.kind {
            LayerKind::UniLstm {
                hidden_size,
                input_size,
                weights,
                ..
            } => {
                assert_eq!((*hidden_size, *input_size), (1, 2));
                let w_x: Vec<Vec<f32>> = weights.w_x.iter().map(|w| w.values.clone()).collect();
                assert_eq!(w_x, vec![vec![0.0, 1.0], vec![4.0, 5.0], vec![2.0, 3.0], vec![6.0, 7.0]]);
                let b: Vec<f32> = weights
                    .bias
                    .as_ref()
                    .unwrap()
                    .iter()
                    .map(|b| b.values[0])
                    .collect();
                assert_eq!(b, vec![4.0, 8.0, 6.0, 10.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(g.optional_inputs.len(), 2);
        assert_eq!(g.optional_outputs.len(), 2);
        assert_eq!(g.optional_inputs[0].shape, vec![1]);
        assert_eq!(g.axis_map.get("y"), Some(&[Sequence, Height, Batch, Channel][..]));
        assert_eq!(g.axis_map.get("y_h_output"), Some(&[Sequence, Batch, Channel][..]));
    }

    #[test]
    fn test_lstm_state_mapping_follows_known_rank() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r"], &["y", "yh"])
            .with_tensor("w", iota(&[1, 4, 2]))
            .with_tensor("r", iota(&[1, 4, 1]));
        let mut g = graph(vec![node.clone()], &[5, 1, 2]);
        g.axis_map.insert("x", smallvec![Sequence, Batch, Channel]);
        g.shape_dict.insert("y".to_string(), vec![5, 1, 1, 1]);
        g.shape_dict.insert("yh".to_string(), vec![1]);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(false, Dialect::Legacy);
        {
            let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
            lstm(&mut cx, &node).unwrap();
        }
        assert_eq!(g.axis_map.get("y").map(<[_]>::len), Some(4));
        assert!(g.axis_map.get("yh").is_none());
        g.axis_map.verify_ranks(&g.shape_dict).unwrap();
    }

    #[test]
    fn test_lstm_without_recurrence_weights_fails() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r"], &["y"]).with_tensor("w", iota(&[1, 4, 2]));
        let mut g = graph(vec![node.clone()], &[5, 1, 2]);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(true, Dialect::Legacy);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        assert!(matches!(lstm(&mut cx, &node), Err(ConvertError::MissingInitializer { .. })));
    }
}
