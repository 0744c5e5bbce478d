//! Arbitrary-rank lowering table
//!
//! Blobs keep their ONNX rank, so there is no axis map to consult. Where a
//! layer needs a particular rank (convolution, batchnorm, recurrent cells)
//! the lowering asks for the input's static rank and pads it with
//! `expandDims` / `squeeze` around the layer.
//!
//! Constant inputs are not loaded up front. Each lowering that reads a blob
//! calls [`load_input_constants`], which emits a `loadConstantND` per edge
//! at most once per compile.

#![allow(missing_docs)]

mod dense;
mod math;
mod shape;
mod spatial;

use tracing::trace;

use super::legacy::{elementwise as act, spatial as window, Placement};
use super::{LoweringCx, LoweringFn};
use crate::axis::{Axis, AxisResult, Unmappable};
use crate::builder::{BinaryOp, LayerKind, WeightParams};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::tensor::{shape_of, Tensor};

pub(crate) const ENTRIES: &[(&str, LoweringFn)] = &[
    ("Abs", act::abs),
    ("Acos", math::math),
    ("Acosh", math::math),
    ("Add", math::broadcastable),
    ("And", math::logical),
    ("ArgMax", shape::arg_reduce),
    ("ArgMin", shape::arg_reduce),
    ("Asin", math::math),
    ("Asinh", math::math),
    ("Atan", math::math),
    ("Atanh", math::math),
    ("AveragePool", window::pool::<RankExpanded>),
    ("BatchNormalization", spatial::batch_norm),
    ("Cast", math::cast),
    ("Ceil", math::math),
    ("Clip", math::clip),
    ("Concat", shape::concat),
    ("Constant", shape::constant),
    ("ConstantOfShape", shape::constant_of_shape),
    ("Conv", spatial::conv),
    ("ConvTranspose", spatial::conv),
    ("Cos", math::math),
    ("Cosh", math::math),
    ("DepthToSpace", window::reorganize_data),
    ("Div", math::broadcastable),
    ("Dropout", math::identity),
    ("Elu", act::elu),
    ("Equal", math::compare),
    ("Erf", math::math),
    ("Exp", act::exp),
    ("Expand", shape::expand),
    ("Flatten", shape::flatten),
    ("Floor", math::math),
    ("Gather", shape::gather),
    ("Gemm", dense::gemm),
    ("GlobalAveragePool", window::pool::<RankExpanded>),
    ("GlobalMaxPool", window::pool::<RankExpanded>),
    ("Greater", math::compare),
    ("GRU", dense::gru),
    ("HardSigmoid", act::hard_sigmoid),
    ("Identity", math::identity),
    ("InstanceNormalization", spatial::instance_norm),
    ("LeakyRelu", act::leaky_relu),
    ("Less", math::compare),
    ("Log", act::log),
    ("LogSoftmax", math::softmax),
    ("LRN", window::lrn),
    ("LSTM", dense::lstm),
    ("MatMul", dense::matmul),
    ("Max", math::broadcastable),
    ("MaxPool", window::pool::<RankExpanded>),
    ("Mean", math::mean),
    ("Min", math::broadcastable),
    ("Mod", math::broadcastable),
    ("Mul", math::broadcastable),
    ("Neg", act::neg),
    ("NonZero", shape::non_zero),
    ("Not", math::logical),
    ("Or", math::logical),
    ("Pad", shape::pad),
    ("Pow", math::broadcastable),
    ("PRelu", act::prelu),
    ("RandomNormal", math::random),
    ("RandomNormalLike", math::random),
    ("RandomUniform", math::random),
    ("RandomUniformLike", math::random),
    ("Reciprocal", act::reciprocal),
    ("ReduceL1", shape::reduce),
    ("ReduceL2", shape::reduce),
    ("ReduceLogSum", shape::reduce),
    ("ReduceLogSumExp", shape::reduce),
    ("ReduceMax", shape::reduce),
    ("ReduceMean", shape::reduce),
    ("ReduceMin", shape::reduce),
    ("ReduceProd", shape::reduce),
    ("ReduceSum", shape::reduce),
    ("ReduceSumSquare", shape::reduce),
    ("Relu", act::relu),
    ("Reshape", shape::reshape),
    ("Resize", spatial::resize),
    ("ReverseSequence", shape::reverse_sequence),
    ("RoiAlign", spatial::roi_align),
    ("Round", math::math),
    ("Scatter", shape::scatter),
    ("Selu", act::selu),
    ("Shape", shape::get_shape),
    ("Sigmoid", act::sigmoid),
    ("Sign", act::sign),
    ("Size", shape::size),
    ("Slice", shape::slice),
    ("Softmax", math::softmax),
    ("Softplus", act::softplus),
    ("Softsign", act::softsign),
    ("SpaceToDepth", window::reorganize_data),
    ("Split", shape::split),
    ("Sqrt", act::sqrt),
    ("Squeeze", shape::squeeze),
    ("Sub", math::broadcastable),
    ("Sum", math::broadcastable),
    ("Tanh", math::math),
    ("ThresholdedRelu", act::thresholded_relu),
    ("Tile", shape::tile),
    ("TopK", shape::top_k),
    ("Transpose", shape::transpose),
    ("Unsqueeze", shape::unsqueeze),
    ("Upsample", window::upsample),
    ("Where", math::where_op),
    ("Xor", math::logical),
];

// ============================================================================
// Shared helpers
// ============================================================================

/// Shape a constant is loaded with; scalars become `[1]`
fn load_shape(value: &Tensor) -> Vec<i64> {
    if value.ndim() == 0 {
        vec![1]
    } else {
        shape_of(value)
    }
}

/// Load `value` into blob `edge` unless an earlier layer already did
pub(crate) fn load_constant(
    cx: &mut LoweringCx<'_>,
    layer_name: &str,
    edge: &str,
    value: &Tensor,
) -> ConvertResult<()> {
    if cx.graph.constants_loaded.contains(edge) {
        return Ok(());
    }
    cx.emit(
        layer_name,
        &[],
        &[edge],
        LayerKind::LoadConstantNd {
            shape: load_shape(value),
            constant: WeightParams::from(value),
        },
    )?;
    trace!(edge, "loaded constant");
    cx.graph.constants_loaded.insert(edge.to_string());
    Ok(())
}

/// Emit a `loadConstantND` for every constant input of `node`
pub fn load_input_constants(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    for (i, edge) in node.inputs.iter().enumerate() {
        if let Some(value) = node.input_tensors.get(edge) {
            load_constant(cx, &format!("{}_load_constant_{}", node.name, i), edge, value)?;
        }
    }
    Ok(())
}

/// Fold the inputs of an n-ary op into a chain of binary broadcastable layers
///
/// One input is copied. Intermediate blobs are `{output}_{i}`; the layers
/// after the first are `{node}_{i}`.
pub(crate) fn broadcast_chain(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    op: BinaryOp,
    output: &str,
) -> ConvertResult<()> {
    let kind = || LayerKind::Broadcastable { op };
    let inputs = &node.inputs;
    match inputs.len() {
        0 => cx.reject(node, "expects at least one input"),
        1 => cx.identity(&node.name, &inputs[0], output),
        2 => cx.emit(
            &node.name,
            &[inputs[0].as_str(), inputs[1].as_str()],
            &[output],
            kind(),
        ),
        n => {
            let step = |i: usize| format!("{}_{}", output, i);
            cx.emit(
                &node.name,
                &[inputs[0].as_str(), inputs[1].as_str()],
                &[step(0).as_str()],
                kind(),
            )?;
            for i in 2..n - 1 {
                cx.emit(
                    &format!("{}_{}", node.name, i - 2),
                    &[step(i - 2).as_str(), inputs[i].as_str()],
                    &[step(i - 1).as_str()],
                    kind(),
                )?;
            }
            cx.emit(
                &format!("{}_{}", node.name, n - 3),
                &[step(n - 3).as_str(), inputs[n - 1].as_str()],
                &[output],
                kind(),
            )
        }
    }
}

/// Human-readable rank for rejection messages
fn describe_rank(rank: Option<usize>) -> String {
    rank.map_or_else(|| "unknown".to_string(), |r| r.to_string())
}

/// Run a rank-4 layer on rank-3 input by expanding to `[1, B, C, 1, L]`
///
/// The layer reads `{node}_{input}_expanded` and writes
/// `{node}_{output}_expanded`, which is squeezed back into the output.
pub(crate) struct RankExpanded;

/// Axes added around a 1-D spatial layer
const SPATIAL_EXPAND_AXES: [i64; 2] = [0, 3];

impl Placement for RankExpanded {
    fn spatial_axis(cx: &LoweringCx<'_>, node: &Node) -> AxisResult<Option<Axis>> {
        match cx.rank(node.first_input()) {
            Some(4) => Ok(None),
            Some(3) => Ok(Some(Axis::Width)),
            rank => Err(Unmappable::new(format!(
                "provided number axes {} not supported",
                describe_rank(rank)
            ))),
        }
    }

    fn place<F>(cx: &mut LoweringCx<'_>, node: &Node, emit: F) -> ConvertResult<()>
    where
        F: FnOnce(&mut LoweringCx<'_>, Option<Axis>, &[String], &[String]) -> ConvertResult<()>,
    {
        match cx.rank(node.first_input()) {
            Some(4) => emit(cx, None, &node.inputs, &node.outputs),
            Some(3) => {
                let expanded_in = format!("{}_{}_expanded", node.name, node.first_input());
                let expanded_out = format!("{}_{}_expanded", node.name, node.first_output());
                cx.emit1(
                    &format!("{}_ip_expand", node.name),
                    node.first_input(),
                    &expanded_in,
                    LayerKind::ExpandDims {
                        axes: SPATIAL_EXPAND_AXES.to_vec(),
                    },
                )?;
                let mut inputs = node.inputs.clone();
                inputs[0] = expanded_in;
                emit(cx, Some(Axis::Width), &inputs, &[expanded_out.clone()])?;
                cx.emit1(
                    &format!("{}_ip_squeeze_out", node.name),
                    &expanded_out,
                    node.first_output(),
                    LayerKind::Squeeze {
                        axes: Some(SPATIAL_EXPAND_AXES.to_vec()),
                    },
                )
            }
            rank => cx.reject(
                node,
                format!("provided number axes {} not supported", describe_rank(rank)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SpecBuilder;
    use crate::lowering::test_util::{graph, spec_with};
    use crate::lowering::{Dialect, ErrorHandler};
    use crate::tensor::{scalar, tensor_from_vec};

    #[test]
    fn test_table_covers_nd_surface() {
        let ops: Vec<&str> = ENTRIES.iter().map(|(op, _)| *op).collect();
        assert_eq!(ops.len(), 108);
        for op in ["Cast", "GRU", "Where", "RoiAlign", "Conv", "LSTM"] {
            assert!(ops.contains(&op), "{} missing", op);
        }
        assert!(!ops.contains(&"SpatialBN"));
        assert!(!ops.contains(&"MeanVarianceNormalization"));
    }

    #[test]
    fn test_constants_loaded_once_with_scalar_shape() {
        let a = Node::new("a", "Add", &["x", "c"], &["y"]).with_tensor("c", scalar(2.0));
        let b = Node::new("b", "Mul", &["y", "c"], &["z"]).with_tensor("c", scalar(2.0));
        let mut g = graph(vec![a.clone(), b.clone()], &[2, 3]);
        let mut s = spec_with(4, &[2, 3]);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);

        load_input_constants(&mut cx, &a).unwrap();
        load_input_constants(&mut cx, &b).unwrap();
        assert_eq!(s.layers().len(), 1);
        assert_eq!(s.layers()[0].name, "a_load_constant_1");
        match &s.layers()[0].kind {
            LayerKind::LoadConstantNd { shape, .. } => assert_eq!(shape, &vec![1]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.rank("c"), Some(1));
    }

    #[test]
    fn test_broadcast_chain_names() {
        let node = Node::new("sum", "Sum", &["a", "b", "c", "d"], &["y"]);
        let mut g = graph(vec![], &[2, 3]);
        let mut s = spec_with(4, &[2, 3]);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);

        broadcast_chain(&mut cx, &node, BinaryOp::Add, "y").unwrap();
        let layers = s.layers();
        let names: Vec<&str> = layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["sum", "sum_0", "sum_1"]);
        assert_eq!(layers[0].outputs, vec!["y_0"]);
        assert_eq!(layers[1].inputs, vec!["y_0", "c"]);
        assert_eq!(layers[2].inputs, vec!["y_1", "d"]);
        assert_eq!(layers[2].outputs, vec!["y"]);
    }

    #[test]
    fn test_rank3_pool_is_expanded() {
        let node = Node::new("pool", "MaxPool", &["x"], &["y"])
            .with_attr("kernel_shape", crate::graph::AttrValue::Ints(vec![2]));
        let mut g = graph(vec![node.clone()], &[1, 3, 8]);
        let mut s = spec_with(4, &[1, 3, 8]);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);

        window::pool::<RankExpanded>(&mut cx, &node).unwrap();
        let layers = s.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].outputs, vec!["pool_x_expanded"]);
        assert_eq!(layers[1].inputs, vec!["pool_x_expanded"]);
        match &layers[1].kind {
            LayerKind::Pooling { kernel, .. } => assert_eq!(kernel, &[1, 2]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(layers[2].outputs, vec!["y"]);
        assert_eq!(s.rank("y"), Some(3));
    }

    #[test]
    fn test_rank5_pool_is_rejected() {
        let node = Node::new("pool", "GlobalMaxPool", &["x"], &["y"]);
        let mut g = graph(vec![node.clone()], &[1, 1, 3, 4, 4]);
        let mut s = spec_with(4, &[1, 1, 3, 4, 4]);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        let e = window::pool::<RankExpanded>(&mut cx, &node).unwrap_err();
        assert!(e.to_string().contains("provided number axes 5"));
    }

    #[test]
    fn test_rejected_rank3_deconv_is_not_expanded() {
        let w = tensor_from_vec(&[3, 4, 2], vec![0.5; 24]).unwrap();
        let node = Node::new("deconv", "ConvTranspose", &["x", "w"], &["y"])
            .with_tensor("w", w)
            .with_attr("output_padding", crate::graph::AttrValue::Ints(vec![1, 1, 1]));
        let mut g = graph(vec![node.clone()], &[1, 3, 8]);
        let mut s = spec_with(4, &[1, 3, 8]);
        let mut err = ErrorHandler::new(true, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);

        spatial::conv(&mut cx, &node).unwrap();
        let layers = s.layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].outputs, vec!["y"]);
        assert!(matches!(layers[0].kind, LayerKind::Custom { .. }));
    }

    #[test]
    fn test_load_constant_keeps_shape() {
        let t = tensor_from_vec(&[2, 2], vec![1.0; 4]).unwrap();
        let mut g = graph(vec![], &[2, 2]);
        let mut s = spec_with(4, &[2, 2]);
        let mut err = ErrorHandler::new(false, Dialect::Nd);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        load_constant(&mut cx, "w_load", "w", &t).unwrap();
        load_constant(&mut cx, "w_load_again", "w", &t).unwrap();
        assert_eq!(s.layers().len(), 1);
        assert_eq!(s.rank("w"), Some(2));
    }
}
