//! Convolution, normalization and resampling on rank-3 and rank-4 blobs

use tracing::debug;

use super::{describe_rank, RankExpanded, SPATIAL_EXPAND_AXES};
use crate::builder::{BorderMode, LayerKind, PoolingType, ResizeMode, UpsampleMode};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::legacy::spatial::{
    batch_norm_kind, conv_bias, instance_norm_kind, output_padding_reject, ConvSpec,
};
use crate::lowering::legacy::Placement;
use crate::lowering::LoweringCx;

// ============================================================================
// Convolution
// ============================================================================

/// `Conv` and `ConvTranspose`
///
/// A weight that is not an initializer is laid out for the target at run
/// time: rank-3 weights gain a unit height, then `[O, I, H, W]` is permuted to
/// `[H, W, I, O]` (`[H, W, O, I]` for transposed convolutions).
pub(super) fn conv(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let is_deconv = node.op_type == "ConvTranspose";
    let mut rewired = node.clone();
    let (weight, weight_shape) = match node.input_tensor(1) {
        Some(w) => (Some(w.clone()), w.shape().to_vec()),
        None => {
            let w_edge = node.inputs.get(1).cloned().unwrap_or_default();
            let Some(shape) = cx.shape(&w_edge) else {
                return cx.reject(node, format!("Shape of weight {} not available", w_edge));
            };
            let mut w_name = w_edge.clone();
            if shape.len() == 3 {
                let expanded = format!("{}_{}_expanded", node.name, w_edge);
                cx.emit1(
                    &format!("{}_w_expand", node.name),
                    &w_name,
                    &expanded,
                    LayerKind::ExpandDims { axes: vec![-2] },
                )?;
                w_name = expanded;
            }
            let axes = if is_deconv {
                vec![2, 3, 0, 1]
            } else {
                vec![2, 3, 1, 0]
            };
            let transposed = format!("{}_transposed", w_name);
            cx.emit1(
                &format!("{}_w_transpose", node.name),
                &w_name,
                &transposed,
                LayerKind::Transpose { axes },
            )?;
            rewired.inputs[1] = transposed;
            (None, shape.iter().map(|&d| d.max(1) as usize).collect())
        }
    };

    let spec = ConvSpec {
        node: &rewired,
        weight,
        weight_shape,
        bias: conv_bias(cx, node)?,
        is_deconv,
        groups: node.attrs.int_or("group", 1).max(1) as usize,
    };
    RankExpanded::place_checked(
        cx,
        &rewired,
        |axis| output_padding_reject(node, axis),
        |cx, axis, inputs, outputs| spec.emit(cx, axis, inputs, outputs),
    )
}

// ============================================================================
// Normalization
// ============================================================================

/// Batchnorm on rank 4, or on rank 3 between an expand and a squeeze
fn normalize_with_expansion(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    kind: LayerKind,
) -> ConvertResult<()> {
    let input = node.first_input();
    let output = node.first_output();
    match cx.rank(input) {
        Some(4) => cx.emit1(&node.name, input, output, kind),
        Some(3) => {
            let expanded_in = format!("{}_{}_expanded", node.name, input);
            let expanded_out = format!("{}_expanded", output);
            let axes = SPATIAL_EXPAND_AXES.to_vec();
            cx.emit1(
                &format!("{}_expand", node.name),
                input,
                &expanded_in,
                LayerKind::ExpandDims { axes: axes.clone() },
            )?;
            cx.emit1(&node.name, &expanded_in, &expanded_out, kind)?;
            cx.emit1(
                &format!("{}_squeeze", node.name),
                &expanded_out,
                output,
                LayerKind::Squeeze { axes: Some(axes) },
            )
        }
        rank => cx.reject(
            node,
            format!("provided number axes {} not supported", describe_rank(rank)),
        ),
    }
}

pub(super) fn batch_norm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(kind) = batch_norm_kind(cx, node)? else {
        return Ok(());
    };
    normalize_with_expansion(cx, node, kind)
}

pub(super) fn instance_norm(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    if !(node.is_const_input(1) && node.is_const_input(2)) {
        return cx.reject(node, "CoreML InstanceNorm requires Scale and Bias to be known");
    }
    let kind = instance_norm_kind(cx, node)?;
    normalize_with_expansion(cx, node, kind)
}

// ============================================================================
// Resampling
// ============================================================================

/// Height and width scale factors from constant `scales`, or from constant
/// `sizes` over a known input shape
fn resize_scales(node: &Node, input_shape: Option<&[i64]>) -> Option<(f32, f32)> {
    let scales_input = if node.inputs.len() >= 3 { 2 } else { 1 };
    let scales: Vec<f32> = node
        .input_tensor(scales_input)
        .map(|t| t.iter().copied().collect())
        .unwrap_or_default();
    if scales.len() >= 2 {
        return Some((scales[scales.len() - 2], scales[scales.len() - 1]));
    }
    let sizes = node.input_tensor(3)?;
    let shape = input_shape?;
    let sizes: Vec<f32> = sizes.iter().copied().collect();
    if sizes.len() != shape.len() || shape.len() < 2 {
        return None;
    }
    let n = shape.len();
    let ratio = |i: usize| (shape[i] > 0).then(|| sizes[i] / shape[i] as f32);
    Some((ratio(n - 2)?, ratio(n - 1)?))
}

/// `Resize` as an upsample with static scale factors
pub(super) fn resize(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let input_shape = cx.shape(node.first_input());
    let Some((scaling_factor_h, scaling_factor_w)) = resize_scales(node, input_shape.as_deref())
    else {
        return cx.reject(
            node,
            "Scaling factor unknown!! CoreML does not support dynamic scaling for Resize",
        );
    };
    let mode = if node.attrs.string_or("mode", "nearest") == "nearest" {
        UpsampleMode::Nn
    } else {
        UpsampleMode::Bilinear
    };
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::Upsample {
            scaling_factor_h,
            scaling_factor_w,
            mode,
        },
    )
}

/// `RoiAlign` as crop-resize followed by pooling
///
/// Batch indices are prepended to the boxes to form the target's ROI rows.
/// Each bin is sampled `sampling_ratio` times per axis and pooled back down.
pub(super) fn roi_align(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    if node.inputs.len() < 3 {
        return cx.reject(node, "RoiAlign expects features, rois and batch indices");
    }
    let attrs = &node.attrs;
    let target_height = attrs.int_or("output_height", 1).max(1) as usize;
    let target_width = attrs.int_or("output_width", 1).max(1) as usize;
    let sampling_ratio = attrs.int_or("sampling_ratio", 0);
    if sampling_ratio <= 0 {
        return cx.reject(node, "Adaptive sampling ratio is not supported");
    }
    let ratio = sampling_ratio as usize;
    let spatial_scale = attrs
        .float("spatial_scale")
        .or_else(|| attrs.float("sampling_scale"))
        .unwrap_or(1.0);
    let pool_type = match attrs.string_or("mode", "avg").to_ascii_uppercase().as_str() {
        "MAX" => PoolingType::Max,
        _ => PoolingType::Average,
    };

    let (features, rois, batch_indices) = (&node.inputs[0], &node.inputs[1], &node.inputs[2]);
    if cx.graph.is_graph_input(batch_indices) {
        debug!(edge = %batch_indices, "batch indices folded into the ROI rows");
        cx.graph.inputs.retain(|i| &i.name != batch_indices);
    }

    let features_exp = format!("{}_expanded", features);
    let indices_exp = format!("{}_expanded", batch_indices);
    let rows = format!("{}_rois", rois);
    let rows_exp = format!("{}_expanded", rows);
    let output = node.first_output();
    let cropped = format!("{}_crop_resized", output);
    let squeezed = format!("{}_crop_resized_squeezed", output);

    cx.emit1(
        &format!("{}_expand_0", node.name),
        features,
        &features_exp,
        LayerKind::ExpandDims { axes: vec![0] },
    )?;
    cx.emit1(
        &format!("{}_expand_2", node.name),
        batch_indices,
        &indices_exp,
        LayerKind::ExpandDims { axes: vec![1] },
    )?;
    cx.emit(
        &format!("{}_concat_indices", node.name),
        &[indices_exp.as_str(), rois.as_str()],
        &[rows.as_str()],
        LayerKind::ConcatNd { axis: 1 },
    )?;
    cx.emit1(
        &format!("{}_expand_1", node.name),
        &rows,
        &rows_exp,
        LayerKind::ExpandDims {
            axes: vec![1, 3, 4],
        },
    )?;
    cx.emit(
        &format!("{}_crop_resize", node.name),
        &[features_exp.as_str(), rows_exp.as_str()],
        &[cropped.as_str()],
        LayerKind::CropResize {
            target_height: target_height * ratio,
            target_width: target_width * ratio,
            mode: ResizeMode::RoiAlignMode,
            normalized_coordinates: false,
            spatial_scale,
        },
    )?;
    cx.emit1(
        &format!("{}_squeeze", node.name),
        &cropped,
        &squeezed,
        LayerKind::Squeeze {
            axes: Some(vec![1]),
        },
    )?;
    cx.emit1(
        &format!("{}_pool", node.name),
        &squeezed,
        output,
        LayerKind::Pooling {
            pool_type,
            kernel: [ratio, ratio],
            stride: [ratio, ratio],
            border_mode: BorderMode::Valid { paddings: [0; 4] },
            exclude_pad_area: true,
            is_global: false,
        },
    )
}
