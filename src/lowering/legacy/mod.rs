//! Rank-5 lowering table
//!
//! Every blob is laid out as `[S, B, C, H, W]`. Lowerings read the input's
//! entry in the axis map to decide where an ONNX axis lands, wrap layers in
//! permutes where the target only supports one placement, and record the
//! mapping of what they write. Inputs without a mapping fall back to the
//! static shape, or to the ONNX default layout.

#![allow(missing_docs)]

pub(crate) mod dense;
pub(crate) mod elementwise;
mod shape;
pub(crate) mod spatial;

use tracing::trace;

use super::{LoweringCx, LoweringFn};
use crate::axis::rules::{const_layout, spatial_layout, SpatialLayout};
use crate::axis::{Axis, AxisResult};
use crate::builder::{LayerKind, WeightParams};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::tensor::shape_of;

/// Ops whose constant inputs are loaded as layers before lowering
pub const CONST_INPUT_OPS: &[&str] = &[
    "Add",
    "Sub",
    "Sum",
    "Mul",
    "Concat",
    "Max",
    "Min",
    "Div",
    "Reciprocal",
];

pub(crate) const ENTRIES: &[(&str, LoweringFn)] = &[
    ("Abs", elementwise::abs),
    ("Add", elementwise::add),
    ("ArgMax", shape::argmax),
    ("ArgMin", shape::argmax),
    ("AveragePool", spatial::pool::<AxisMapped>),
    ("BatchNormalization", spatial::batch_norm),
    ("Clip", elementwise::clip),
    ("Concat", shape::concat),
    ("Conv", spatial::conv::<AxisMapped>),
    ("ConvTranspose", spatial::conv::<AxisMapped>),
    ("DepthToSpace", spatial::reorganize_data),
    ("Div", elementwise::div),
    ("Dropout", elementwise::dropout),
    ("Elu", elementwise::elu),
    ("Exp", elementwise::exp),
    ("Flatten", shape::flatten),
    ("Gemm", dense::gemm),
    ("GlobalAveragePool", spatial::pool::<AxisMapped>),
    ("GlobalMaxPool", spatial::pool::<AxisMapped>),
    ("HardSigmoid", elementwise::hard_sigmoid),
    ("InstanceNormalization", spatial::instance_norm),
    ("LeakyRelu", elementwise::leaky_relu),
    ("Log", elementwise::log),
    ("LogSoftmax", elementwise::softmax),
    ("LRN", spatial::lrn),
    ("LSTM", dense::lstm),
    ("MatMul", dense::matmul),
    ("Max", elementwise::max),
    ("MaxPool", spatial::pool::<AxisMapped>),
    ("Mean", elementwise::mean),
    ("MeanVarianceNormalization", spatial::mvn),
    ("Min", elementwise::min),
    ("Mul", elementwise::mul),
    ("Neg", elementwise::neg),
    ("Pad", spatial::pad::<AxisMapped>),
    ("Pow", elementwise::pow),
    ("PRelu", elementwise::prelu),
    ("Reciprocal", elementwise::reciprocal),
    ("ReduceL1", shape::reduce),
    ("ReduceL2", shape::reduce),
    ("ReduceLogSum", shape::reduce),
    ("ReduceMax", shape::reduce),
    ("ReduceMean", shape::reduce),
    ("ReduceMin", shape::reduce),
    ("ReduceProd", shape::reduce),
    ("ReduceSum", shape::reduce),
    ("ReduceSumSquare", shape::reduce),
    ("Relu", elementwise::relu),
    ("Reshape", shape::reshape),
    ("Selu", elementwise::selu),
    ("Sigmoid", elementwise::sigmoid),
    ("Sign", elementwise::sign),
    ("Slice", shape::slice),
    ("Softmax", elementwise::softmax),
    ("Softplus", elementwise::softplus),
    ("Softsign", elementwise::softsign),
    ("SpaceToDepth", spatial::reorganize_data),
    ("SpatialBN", spatial::batch_norm),
    ("Split", shape::split),
    ("Sqrt", elementwise::sqrt),
    ("Squeeze", shape::squeeze),
    ("Sub", elementwise::sub),
    ("Sum", elementwise::add),
    ("Tanh", elementwise::tanh),
    ("ThresholdedRelu", elementwise::thresholded_relu),
    ("Transpose", shape::transpose),
    ("Unsqueeze", shape::unsqueeze),
    ("Upsample", spatial::upsample),
];

/// Emit load-constant layers for the constant inputs of `node`
///
/// Only ops in [`CONST_INPUT_OPS`] load their constants; each edge is loaded
/// once per compile. Returns `false` when a constant could not be laid out
/// and the node went to the escape hatch instead.
pub fn load_constant_inputs(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<bool> {
    if !CONST_INPUT_OPS.contains(&node.op_type.as_str()) || node.input_tensors.is_empty() {
        return Ok(true);
    }
    let sibling = node.inputs.iter().rev().find_map(|i| cx.mapping(i));

    for name in &node.inputs {
        let Some(value) = node.input_tensors.get(name) else {
            continue;
        };
        if cx.graph.constants_loaded.contains(name) {
            continue;
        }
        let layout = match const_layout(&shape_of(value), sibling.as_deref()) {
            Ok(layout) => layout,
            Err(e) => {
                cx.reject(node, e.0)?;
                return Ok(false);
            }
        };

        let load_name = match layout.post_perm {
            Some(_) => format!("{}_pre_transpose", name),
            None => name.clone(),
        };
        cx.emit(
            &load_name,
            &[],
            &[&load_name],
            LayerKind::LoadConstant {
                shape: layout.shape,
                constant: WeightParams::from_values(value.iter().copied().collect()),
            },
        )?;
        if let Some(perm) = layout.post_perm {
            cx.emit1(name, &load_name, name, LayerKind::Permute { axes: perm })?;
        }
        trace!(edge = %name, mapping = ?layout.mapping, "loaded constant");
        cx.set_mapping(name, layout.mapping);
        cx.graph.constants_loaded.insert(name.clone());
    }
    Ok(true)
}

/// Where a conv-like layer (conv, pool, pad) runs
///
/// `emit` receives the 1-D spatial axis, if any, and the blob names to read
/// and write. A placement may rewrite blobs around the call.
pub(crate) trait Placement {
    /// 1-D spatial axis the layer will run along, `None` for 2-D
    fn spatial_axis(cx: &LoweringCx<'_>, node: &Node) -> AxisResult<Option<Axis>>;

    fn place<F>(cx: &mut LoweringCx<'_>, node: &Node, emit: F) -> ConvertResult<()>
    where
        F: FnOnce(&mut LoweringCx<'_>, Option<Axis>, &[String], &[String]) -> ConvertResult<()>;

    /// `place` once `check` accepts the spatial axis
    ///
    /// A rejection here happens before any wrapping layer is emitted, so the
    /// custom layer is the only writer of the node's outputs.
    fn place_checked<C, F>(
        cx: &mut LoweringCx<'_>,
        node: &Node,
        check: C,
        emit: F,
    ) -> ConvertResult<()>
    where
        C: FnOnce(Option<Axis>) -> Option<String>,
        F: FnOnce(&mut LoweringCx<'_>, Option<Axis>, &[String], &[String]) -> ConvertResult<()>,
    {
        let axis = match Self::spatial_axis(cx, node) {
            Ok(axis) => axis,
            Err(unmappable) => return cx.reject(node, unmappable.0),
        };
        if let Some(reason) = check(axis) {
            return cx.reject(node, reason);
        }
        Self::place(cx, node, emit)
    }
}

/// Placement read from the axis map
pub(crate) struct AxisMapped;

impl Placement for AxisMapped {
    fn spatial_axis(cx: &LoweringCx<'_>, node: &Node) -> AxisResult<Option<Axis>> {
        match cx.mapping(node.first_input()) {
            Some(mapping) => spatial_layout(&mapping).map(|layout| layout.axis()),
            None => Ok(None),
        }
    }

    fn place<F>(cx: &mut LoweringCx<'_>, node: &Node, emit: F) -> ConvertResult<()>
    where
        F: FnOnce(&mut LoweringCx<'_>, Option<Axis>, &[String], &[String]) -> ConvertResult<()>,
    {
        conv_like(cx, node, emit)
    }
}

/// Emit a conv-like layer where its input's mapping allows
///
/// Inputs laid out as `[C, H, W]` or `[B, C, S]` are permuted so the
/// spatial axis becomes Width.
fn conv_like<F>(cx: &mut LoweringCx<'_>, node: &Node, emit: F) -> ConvertResult<()>
where
    F: FnOnce(&mut LoweringCx<'_>, Option<Axis>, &[String], &[String]) -> ConvertResult<()>,
{
    let Some(mapping) = cx.mapping(node.first_input()) else {
        return emit(cx, None, &node.inputs, &node.outputs);
    };
    let layout = layout!(cx, node, spatial_layout(&mapping));
    match layout {
        SpatialLayout::WidthSwapped(perm) => {
            let inputs = vec![node.first_input().to_string()];
            cx.with_transpose(node, &inputs, &node.outputs, perm, |cx, i, o| {
                emit(cx, Some(Axis::Width), i, o)
            })
        }
        _ => emit(cx, layout.axis(), &node.inputs, &node.outputs),
    }
}
