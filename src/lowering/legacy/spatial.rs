//! Convolution, pooling, padding and normalization

use ndarray::Axis as NdAxis;

use super::{AxisMapped, Placement};
use crate::axis::Axis;
use crate::builder::{
    BorderMode, LayerKind, PaddingMode, PoolingType, ReorganizeMode, SameAsymmetry, UpsampleMode,
    WeightParams,
};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::{float_attr_or_input, ints_attr_or_input, LoweringCx};
use crate::tensor::Tensor;

// ============================================================================
// Window parameters
// ============================================================================

/// Place per-axis values on `[height, width]`; 1-D ops fill the other side
fn spread(values: &[i64], axis: Option<Axis>, fill: i64) -> [i64; 2] {
    let first = values.first().copied().unwrap_or(fill);
    match axis {
        Some(Axis::Height) => [first, fill],
        Some(Axis::Width) => [fill, first],
        _ => [first, values.get(1).copied().unwrap_or(fill)],
    }
}

/// ONNX pads as `[top, left, bottom, right]`
fn pads_tlbr(values: &[i64], axis: Option<Axis>) -> [i64; 4] {
    let at = |i: usize| values.get(i).copied().unwrap_or(0);
    match axis {
        Some(Axis::Height) => [at(0), 0, at(1), 0],
        Some(Axis::Width) => [0, at(0), 0, at(1)],
        _ => [at(0), at(1), at(2), at(3)],
    }
}

fn valid(pads: [i64; 4]) -> BorderMode {
    BorderMode::Valid {
        paddings: [pads[0], pads[2], pads[1], pads[3]],
    }
}

fn same_padding(node: &Node) -> Option<SameAsymmetry> {
    match node.attrs.string("auto_pad") {
        Some("SAME_UPPER") => Some(SameAsymmetry::BottomRightHeavy),
        Some("SAME_LOWER") => Some(SameAsymmetry::TopLeftHeavy),
        _ => None,
    }
}

fn to_usize(v: [i64; 2]) -> [usize; 2] {
    [v[0].max(0) as usize, v[1].max(0) as usize]
}

// ============================================================================
// Convolution
// ============================================================================

/// One convolution; a `None` weight is read from the second input blob
pub(crate) struct ConvSpec<'n> {
    pub node: &'n Node,
    pub weight: Option<Tensor>,
    pub weight_shape: Vec<usize>,
    pub bias: Option<Tensor>,
    pub is_deconv: bool,
    pub groups: usize,
}

impl<'n> ConvSpec<'n> {
    /// Constant weight from input 1 and constant bias from input 2
    pub(crate) fn from_constants(cx: &LoweringCx<'_>, node: &'n Node) -> ConvertResult<Self> {
        let weight = cx.require_const(
            node,
            1,
            &format!(
                "Weight tensor: {} not found in the graph initializer",
                node.inputs.get(1).map_or("", String::as_str)
            ),
        )?;
        Ok(Self {
            node,
            weight_shape: weight.shape().to_vec(),
            weight: Some(weight),
            bias: conv_bias(cx, node)?,
            is_deconv: node.op_type == "ConvTranspose",
            groups: node.attrs.int_or("group", 1).max(1) as usize,
        })
    }

    pub(crate) fn emit(
        self,
        cx: &mut LoweringCx<'_>,
        axis: Option<Axis>,
        inputs: &[String],
        outputs: &[String],
    ) -> ConvertResult<()> {
        let node = self.node;
        let attrs = &node.attrs;
        let w_shape = self.weight_shape.clone();

        let dilation = spread(&attrs.ints("dilations").unwrap_or_default(), axis, 1);
        let mut pads = pads_tlbr(&attrs.ints("pads").unwrap_or_default(), axis);
        let kernel = match attrs.ints("kernel_shape") {
            Some(k) => k,
            None if w_shape.len() == 4 => vec![w_shape[2] as i64, w_shape[3] as i64],
            None => w_shape.last().map(|&k| vec![k as i64]).unwrap_or_default(),
        };
        let kernel = spread(&kernel, axis, 1);
        let stride = spread(&attrs.ints("strides").unwrap_or_default(), axis, 1);

        let weight = self.weight.map(|w| match axis {
            Some(Axis::Height) if w.ndim() == 3 => w.insert_axis(NdAxis(3)),
            Some(Axis::Width) if w.ndim() == 3 => w.insert_axis(NdAxis(2)),
            _ => w,
        });

        let mut output_shape = None;
        let mut crops = [0i64; 4];
        let mut moved_to_crop = false;
        if self.is_deconv {
            if let Some(shape) = attrs.ints("output_shape") {
                let last = shape.last().copied().unwrap_or(1);
                let hw = match axis {
                    Some(Axis::Height) => [last, 1],
                    Some(Axis::Width) => [1, last],
                    _ => [shape.iter().rev().nth(1).copied().unwrap_or(1), last],
                };
                output_shape = Some(to_usize(hw));
            } else if let Some(post) = attrs.ints("output_padding") {
                if post.iter().sum::<i64>() != 0 {
                    let (t, l, b, r) = match (post.as_slice(), axis) {
                        ([p], Some(Axis::Height)) => (0, 0, *p, 0),
                        ([p], Some(Axis::Width)) => (0, 0, 0, *p),
                        ([_], _) => {
                            return cx.reject(
                                node,
                                "length 1 output padding attribute only supported for 1D conv",
                            )
                        }
                        ([p0, p1], Some(Axis::Width)) => (0, 0, *p1, *p0),
                        ([p0, p1], _) => (0, 0, *p0, *p1),
                        ([b, r, t, l], _) => (*t, *l, *b, *r),
                        _ => {
                            return cx.reject(
                                node,
                                "Supports only length 1 or 2 or 4 output padding attribute",
                            )
                        }
                    };
                    moved_to_crop = true;
                    crops = pads;
                    pads = [0; 4];
                    for (idx, v) in [t, l, b, r].into_iter().enumerate() {
                        if crops[idx] >= v {
                            crops[idx] -= v;
                        } else {
                            pads[idx] = v - crops[idx];
                            crops[idx] = 0;
                        }
                    }
                }
            }
        }
        let pre_pad = moved_to_crop && pads.iter().sum::<i64>() > 0;
        let post_crop = moved_to_crop && crops.iter().sum::<i64>() > 0;

        let dim = |i: usize| w_shape.get(i).copied().unwrap_or(1);
        let (output_channels, kernel_channels) = if self.is_deconv {
            (dim(1) * self.groups, dim(0))
        } else {
            (dim(0), dim(1))
        };

        let mut input = inputs[0].clone();
        if pre_pad {
            let padded = format!("{}_conv_transpose_pre_pad", input);
            cx.emit1(
                &format!("{}_pre_pad", node.name),
                &input,
                &padded,
                LayerKind::Padding {
                    mode: PaddingMode::Constant,
                    value: 0.0,
                    top: pads[0],
                    bottom: pads[2],
                    left: pads[1],
                    right: pads[3],
                },
            )?;
            input = padded;
        }
        let output = if post_crop {
            format!("{}_conv_transpose_post_crop", outputs[0])
        } else {
            outputs[0].clone()
        };

        let border_mode = match same_padding(node) {
            Some(asymmetry) => BorderMode::Same { asymmetry },
            None if pre_pad => valid([0; 4]),
            None => valid(pads),
        };
        let mut conv_inputs = vec![input.as_str()];
        if weight.is_none() {
            conv_inputs.extend(inputs.get(1).map(String::as_str));
        }
        cx.emit(
            &node.name,
            &conv_inputs,
            &[output.as_str()],
            LayerKind::Convolution {
                kernel_channels,
                output_channels,
                kernel: to_usize(kernel),
                stride: to_usize(stride),
                dilation: to_usize(dilation),
                border_mode,
                groups: self.groups,
                weights: weight.as_ref().map(WeightParams::from).unwrap_or_default(),
                bias: self.bias.as_ref().map(WeightParams::from),
                is_deconv: self.is_deconv,
                output_shape,
            },
        )?;

        if post_crop {
            cx.emit1(
                &format!("{}_post_crop", node.name),
                &output,
                &outputs[0],
                LayerKind::Crop {
                    top: crops[0],
                    bottom: crops[2],
                    left: crops[1],
                    right: crops[3],
                    offset: vec![0, 0],
                },
            )?;
        }
        Ok(())
    }
}

/// Bias of a conv; it must be a constant when present
pub(crate) fn conv_bias(cx: &LoweringCx<'_>, node: &Node) -> ConvertResult<Option<Tensor>> {
    match node.input(2) {
        None => Ok(None),
        Some(name) => match node.input_tensor(2) {
            Some(b) => Ok(Some(b.clone())),
            None => cx.missing(
                node,
                format!("Bias tensor: {} not found in the graph initializer", name),
            ),
        },
    }
}

/// Why a transposed conv's `output_padding` cannot run along `axis`
pub(crate) fn output_padding_reject(node: &Node, axis: Option<Axis>) -> Option<String> {
    if node.op_type != "ConvTranspose" || node.attrs.contains("output_shape") {
        return None;
    }
    let post = node.attrs.ints("output_padding")?;
    if post.iter().sum::<i64>() == 0 {
        return None;
    }
    match (post.len(), axis) {
        (1, Some(Axis::Height | Axis::Width)) | (2, _) | (4, _) => None,
        (1, _) => Some("length 1 output padding attribute only supported for 1D conv".into()),
        _ => Some("Supports only length 1 or 2 or 4 output padding attribute".into()),
    }
}

/// `Conv` and `ConvTranspose`
pub(crate) fn conv<P: Placement>(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let spec = ConvSpec::from_constants(cx, node)?;
    P::place_checked(
        cx,
        node,
        |axis| output_padding_reject(node, axis),
        |cx, axis, inputs, outputs| spec.emit(cx, axis, inputs, outputs),
    )?;
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Pooling and padding
// ============================================================================

pub(crate) fn pool<P: Placement>(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let is_global = node.op_type.starts_with("Global");
    let pool_type = if node.op_type.ends_with("MaxPool") {
        PoolingType::Max
    } else if node.op_type.ends_with("AveragePool") {
        PoolingType::Average
    } else {
        return cx.reject(node, "Unsupported pool type");
    };
    if node.outputs.len() == 2 {
        return cx.reject(node, "argmax with pool unsupported");
    }
    if node.attrs.int("ceil_mode") == Some(1) {
        return cx.reject(node, "ceil_mode=1 not supported");
    }
    if node.attrs.contains("dilations") {
        return cx.reject(node, "dilations not supported");
    }
    let kernel = node.attrs.ints("kernel_shape");
    if !is_global && kernel.is_none() {
        return cx.reject(node, "kernel_shape attribute is required");
    }

    P::place(cx, node, |cx, axis, inputs, outputs| {
        let attrs = &node.attrs;
        let (kernel, stride, border_mode) = if is_global {
            ([0, 0], [1, 1], valid([0; 4]))
        } else {
            let kernel = kernel.unwrap_or_default();
            let border = match same_padding(node) {
                Some(asymmetry) => BorderMode::Same { asymmetry },
                None => valid(pads_tlbr(&attrs.ints("pads").unwrap_or_default(), axis)),
            };
            (
                to_usize(spread(&kernel, axis, 1)),
                to_usize(spread(&attrs.ints("strides").unwrap_or_default(), axis, 1)),
                border,
            )
        };
        cx.emit1(
            &node.name,
            &inputs[0],
            &outputs[0],
            LayerKind::Pooling {
                pool_type,
                kernel,
                stride,
                border_mode,
                exclude_pad_area: attrs.int_or("count_include_pad", 0) == 0,
                is_global,
            },
        )
    })?;
    cx.keep_mapping(node);
    Ok(())
}

pub(crate) fn pad<P: Placement>(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(pads) = ints_attr_or_input(node, "pads", 1) else {
        return cx.missing(node, "Pad amounts must be an attribute or a graph initializer");
    };
    if pads.len() % 2 != 0 || pads.len() < 2 {
        return cx.reject(
            node,
            format!("pads attribute: {:?}. Length of pads must be a multiple of 2", pads),
        );
    }
    let unsupported = format!("Paddings value {:?} not supported", pads);
    let pads = match pads.len() {
        8 => {
            if pads[..2].iter().chain(&pads[4..6]).any(|&p| p != 0) {
                return cx.reject(node, unsupported);
            }
            vec![pads[2], pads[3], pads[6], pads[7]]
        }
        6 => {
            if pads[..2].iter().chain(&pads[3..5]).any(|&p| p != 0) {
                return cx.reject(node, unsupported);
            }
            vec![pads[2], pads[5]]
        }
        _ => pads,
    };
    let mode = match node.attrs.string_or("mode", "constant") {
        "reflect" => PaddingMode::Reflection,
        "edge" => PaddingMode::Replication,
        _ => PaddingMode::Constant,
    };
    let value = float_attr_or_input(node, "value", 2).unwrap_or(0.0);

    let pads_len = pads.len();
    let check = |axis: Option<Axis>| {
        let expected = if axis.is_some() { 2 } else { 4 };
        (pads_len != expected).then(|| unsupported.clone())
    };
    P::place_checked(cx, node, check, |cx, axis, inputs, outputs| {
        let [top, left, bottom, right] = pads_tlbr(&pads, axis);
        cx.emit1(
            &node.name,
            &inputs[0],
            &outputs[0],
            LayerKind::Padding {
                mode,
                value,
                top,
                bottom,
                left,
                right,
            },
        )
    })?;
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Normalization
// ============================================================================

/// Batchnorm layer of a `BatchNormalization` node
///
/// Returns `None` once the node has been rejected.
pub(crate) fn batch_norm_kind(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<Option<LayerKind>> {
    if node.outputs.len() > 1 {
        cx.reject(
            node,
            "This converter only supports BatchNormalization with one output",
        )?;
        return Ok(None);
    }
    let epsilon = node.attrs.float_or("epsilon", 1e-5);
    let lengths: Vec<usize> = (1..5).filter_map(|i| node.input_tensor(i)).map(Tensor::len).collect();
    let Some(&channels) = lengths.first() else {
        return cx.missing(node, "BatchNormalization parameters must be graph initializers");
    };
    if lengths.iter().any(|&n| n != channels) {
        cx.reject(node, "Shape mismatch between Scale, Bias, Mean and Variance")?;
        return Ok(None);
    }
    let param = |i: usize, fill: f32| {
        node.input_tensor(i)
            .map(|t| WeightParams::from_values(t.iter().copied().collect()))
            .unwrap_or_else(|| WeightParams::filled(channels, fill))
    };
    Ok(Some(LayerKind::Batchnorm {
        channels,
        gamma: param(1, 1.0),
        beta: param(2, 0.0),
        mean: Some(param(3, 0.0)),
        variance: Some(param(4, 1.0)),
        compute_mean_var: false,
        instance_normalization: false,
        epsilon,
    }))
}

pub(crate) fn batch_norm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(kind) = batch_norm_kind(cx, node)? else {
        return Ok(());
    };
    let channel_last = cx
        .mapping(node.first_input())
        .map_or(false, |m| m.as_slice() == [Axis::Channel, Axis::Height, Axis::Width]);
    if channel_last {
        let inputs = vec![node.first_input().to_string()];
        cx.with_transpose(node, &inputs, &node.outputs, [0, 2, 1, 3], |cx, i, o| {
            cx.emit1(&node.name, &i[0], &o[0], kind)
        })?;
    } else {
        cx.emit1(&node.name, node.first_input(), node.first_output(), kind)?;
    }
    cx.keep_mapping(node);
    Ok(())
}

/// Batchnorm layer computing per-instance statistics
pub(crate) fn instance_norm_kind(cx: &LoweringCx<'_>, node: &Node) -> ConvertResult<LayerKind> {
    let scale = cx.require_const(node, 1, "CoreML InstanceNorm requires Scale and Bias to be known")?;
    let bias = cx.require_const(node, 2, "CoreML InstanceNorm requires Scale and Bias to be known")?;
    Ok(LayerKind::Batchnorm {
        channels: scale.len(),
        gamma: WeightParams::from_values(scale.iter().copied().collect()),
        beta: WeightParams::from_values(bias.iter().copied().collect()),
        mean: None,
        variance: None,
        compute_mean_var: true,
        instance_normalization: true,
        epsilon: node.attrs.float_or("epsilon", 1e-5),
    })
}

pub(crate) fn instance_norm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let kind = instance_norm_kind(cx, node)?;
    cx.emit1(&node.name, node.first_input(), node.first_output(), kind)?;
    cx.keep_mapping(node);
    Ok(())
}

pub(crate) fn lrn(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(size) = node.attrs.int("size") else {
        return cx.reject(node, "LRN requires the size attribute");
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Lrn {
            alpha: node.attrs.float_or("alpha", 1e-4),
            beta: node.attrs.float_or("beta", 0.75),
            local_size: size.max(1) as usize,
            k: node.attrs.float_or("bias", 1.0),
        },
    )?;
    cx.keep_mapping(node);
    Ok(())
}

pub(crate) fn mvn(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Mvn {
            across_channels: node.attrs.int_or("across_channels", 0) != 0,
            normalize_variance: node.attrs.int_or("normalize_variance", 1) != 0,
            epsilon: 1e-5,
        },
    )?;
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Resampling
// ============================================================================

pub(crate) fn upsample(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let scales: Option<Vec<f32>> = node.attrs.floats("scales").or_else(|| {
        node.inputs
            .iter()
            .find_map(|i| node.input_tensors.get(i))
            .map(|t| t.iter().copied().collect())
    });
    let (h, w) = match scales {
        Some(s) if s.len() == 4 && s[0] == 1.0 && s[1] == 1.0 => (s[2], s[3]),
        Some(s) => return cx.reject(node, format!("Unsupported scales {:?} for upsample", s)),
        None if node.inputs.len() > 1 => {
            return cx.reject(
                node,
                "This ONNX upsample layer has 'scales' provided as an input. \
                 CoreML upsample requires 'scales' as an attribute of the layer.",
            )
        }
        None => (
            node.attrs.float_or("height_scale", 1.0),
            node.attrs.float_or("width_scale", 1.0),
        ),
    };
    let mode = match node.attrs.string_or("mode", "nearest") {
        "nearest" => UpsampleMode::Nn,
        "linear" | "bilinear" => UpsampleMode::Bilinear,
        other => return cx.reject(node, format!("Unsupported upsample mode {}", other)),
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Upsample {
            scaling_factor_h: h.trunc(),
            scaling_factor_w: w.trunc(),
            mode,
        },
    )?;
    cx.keep_mapping(node);
    Ok(())
}

/// `DepthToSpace` / `SpaceToDepth`
pub(crate) fn reorganize_data(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let mode = if node.op_type == "DepthToSpace" {
        ReorganizeMode::DepthToSpace
    } else {
        ReorganizeMode::SpaceToDepth
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::ReorganizeData {
            mode,
            block_size: node.attrs.int_or("blocksize", 2).max(1) as usize,
        },
    )?;
    cx.keep_mapping(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis::*;
    use crate::axis::AxisMapping;
    use crate::builder::{NeuralNetworkSpec, SpecBuilder};
    use crate::error::ConvertError;
    use crate::graph::AttrValue;
    use crate::lowering::test_util::{graph, spec};
    use crate::lowering::{Dialect, ErrorHandler, LoweringFn};
    use crate::tensor::tensor_from_vec;
    use smallvec::smallvec;

    fn run(
        node: &Node,
        shape: &[i64],
        mapping: AxisMapping,
        f: LoweringFn,
        lenient: bool,
    ) -> (NeuralNetworkSpec, ConvertResult<()>) {
        let mut g = graph(vec![node.clone()], shape);
        g.axis_map.insert("x", mapping);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(lenient, Dialect::Legacy);
        let result = {
            let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
            f(&mut cx, node)
        };
        (s, result)
    }

    fn conv_node(op: &str, w: &[usize]) -> Node {
        let n: usize = w.iter().product();
        let weight = tensor_from_vec(w, vec![0.5; n]).unwrap();
        Node::new("conv", op, &["x", "w"], &["y"]).with_tensor("w", weight)
    }

    #[test]
    fn test_conv_planar() {
        let node = conv_node("Conv", &[8, 3, 3, 3]).with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1]));
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], conv::<AxisMapped>, false);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::Convolution {
                kernel_channels,
                output_channels,
                kernel,
                border_mode,
                ..
            } => {
                assert_eq!((*kernel_channels, *output_channels), (3, 8));
                assert_eq!(kernel, &[3, 3]);
                assert_eq!(border_mode, &BorderMode::Valid { paddings: [1, 1, 1, 1] });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conv_1d_height_expands_weights() {
        let node = conv_node("Conv", &[4, 3, 2]);
        let (s, r) = run(&node, &[1, 3, 8], smallvec![Batch, Channel, Height], conv::<AxisMapped>, false);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::Convolution { kernel, weights, .. } => {
                assert_eq!(kernel, &[2, 1]);
                assert_eq!(weights.shape, vec![4, 3, 2, 1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conv_on_sequence_layout_is_wrapped() {
        let node = conv_node("Conv", &[4, 3, 2]);
        let (s, r) = run(&node, &[1, 3, 8], smallvec![Channel, Height, Width], conv::<AxisMapped>, false);
        r.unwrap();
        let names: Vec<&str> = s.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["conv_input_transpose0", "conv", "conv_output_transpose0"]);
    }

    #[test]
    fn test_deconv_output_padding_moves_pads_to_crop() {
        let node = conv_node("ConvTranspose", &[3, 4, 3, 3])
            .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1]))
            .with_attr("output_padding", AttrValue::Ints(vec![1, 1]));
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], conv::<AxisMapped>, false);
        r.unwrap();
        let layers = s.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].outputs, vec!["y_conv_transpose_post_crop"]);
        match &layers[0].kind {
            LayerKind::Convolution { output_channels, border_mode, .. } => {
                assert_eq!(*output_channels, 4);
                assert_eq!(border_mode, &BorderMode::Valid { paddings: [0; 4] });
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            layers[1].kind,
            LayerKind::Crop {
                top: 1,
                bottom: 0,
                left: 1,
                right: 0,
                offset: vec![0, 0]
            }
        );
    }

    #[test]
    fn test_conv_without_weight_is_hard_failure() {
        let node = Node::new("conv", "Conv", &["x", "w"], &["y"]);
        let (_, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], conv::<AxisMapped>, true);
        assert!(matches!(r, Err(ConvertError::MissingInitializer { .. })));
    }

    #[test]
    fn test_pool_options() {
        let node = Node::new("pool", "MaxPool", &["x"], &["y"])
            .with_attr("kernel_shape", AttrValue::Ints(vec![2, 2]))
            .with_attr("ceil_mode", AttrValue::Int(1));
        let (_, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], pool::<AxisMapped>, false);
        assert!(matches!(r, Err(ConvertError::UnsupportedConfiguration { .. })));

        let node = Node::new("gap", "GlobalAveragePool", &["x"], &["y"]);
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], pool::<AxisMapped>, false);
        r.unwrap();
        assert!(matches!(
            s.layers()[0].kind,
            LayerKind::Pooling { is_global: true, kernel: [0, 0], pool_type: PoolingType::Average, .. }
        ));
    }

    fn writers_of(s: &NeuralNetworkSpec, blob: &str) -> Vec<String> {
        s.layers()
            .iter()
            .filter(|l| l.outputs.iter().any(|o| o == blob))
            .map(|l| l.name.clone())
            .collect()
    }

    #[test]
    fn test_rejected_swapped_layers_emit_no_transposes() {
        let swapped: AxisMapping = smallvec![Channel, Height, Width];

        let pool = Node::new("pool", "MaxPool", &["x"], &["y"]);
        let padding = Node::new("pad", "Pad", &["x"], &["y"])
            .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1]));
        let deconv = conv_node("ConvTranspose", &[3, 4, 2])
            .with_attr("output_padding", AttrValue::Ints(vec![1, 1, 1]));
        let cases: [(&Node, LoweringFn); 3] = [
            (&pool, super::pool::<AxisMapped>),
            (&padding, pad::<AxisMapped>),
            (&deconv, conv::<AxisMapped>),
        ];

        for (node, f) in cases {
            let (s, r) = run(node, &[3, 4, 8], swapped.clone(), f, true);
            r.unwrap();
            assert_eq!(s.layers().len(), 1, "{}", node.op_type);
            assert_eq!(writers_of(&s, "y"), vec![node.name.clone()]);
            assert!(!matches!(s.layers()[0].kind, LayerKind::Permute { .. }));

            let (_, r) = run(node, &[3, 4, 8], swapped.clone(), f, false);
            assert!(matches!(r, Err(ConvertError::UnsupportedConfiguration { .. })));
        }
    }

    #[test]
    fn test_pad_rank4_amounts() {
        let node = Node::new("pad", "Pad", &["x"], &["y"])
            .with_attr("pads", AttrValue::Ints(vec![0, 0, 1, 2, 0, 0, 3, 4]))
            .with_attr("mode", AttrValue::String("reflect".into()));
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], pad::<AxisMapped>, false);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::Padding {
                mode: PaddingMode::Reflection,
                value: 0.0,
                top: 1,
                bottom: 3,
                left: 2,
                right: 4
            }
        );

        let node = Node::new("pad", "Pad", &["x"], &["y"])
            .with_attr("pads", AttrValue::Ints(vec![1, 0, 0, 0, 0, 0, 0, 0]));
        let (_, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], pad::<AxisMapped>, false);
        assert!(r.is_err());
    }

    #[test]
    fn test_batch_norm_fills_missing_params() {
        let scale = tensor_from_vec(&[3], vec![2.0; 3]).unwrap();
        let node = Node::new("bn", "BatchNormalization", &["x", "s", "b", "m", "v"], &["y"])
            .with_tensor("s", scale);
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], batch_norm, false);
        r.unwrap();
        match &s.layers()[0].kind {
            LayerKind::Batchnorm { channels, gamma, beta, variance, .. } => {
                assert_eq!(*channels, 3);
                assert_eq!(gamma.values, vec![2.0; 3]);
                assert_eq!(beta.values, vec![0.0; 3]);
                assert_eq!(variance.as_ref().unwrap().values, vec![1.0; 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_upsample_scales() {
        let node = Node::new("up", "Upsample", &["x"], &["y"])
            .with_attr("scales", AttrValue::Floats(vec![1.0, 1.0, 2.0, 3.5]));
        let (s, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], upsample, false);
        r.unwrap();
        assert_eq!(
            s.layers()[0].kind,
            LayerKind::Upsample {
                scaling_factor_h: 2.0,
                scaling_factor_w: 3.0,
                mode: UpsampleMode::Nn
            }
        );

        let node = Node::new("up", "Upsample", &["x"], &["y"])
            .with_attr("scales", AttrValue::Floats(vec![2.0, 1.0, 2.0, 2.0]));
        let (_, r) = run(&node, &[1, 3, 4, 4], smallvec![Batch, Channel, Height, Width], upsample, false);
        assert!(r.is_err());
    }
}
