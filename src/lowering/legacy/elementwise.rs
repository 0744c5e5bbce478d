//! Activations, unary math and broadcasting arithmetic

use crate::builder::{Activation, ElementwiseMode, LayerKind, UnaryMode, WeightParams};
use crate::error::ConvertResult;
use crate::graph::Node;
use crate::lowering::{float_attr_or_input, LoweringCx};

// ============================================================================
// Broadcasting arithmetic
// ============================================================================

fn broadcast(cx: &mut LoweringCx<'_>, node: &Node, mode: ElementwiseMode) -> ConvertResult<()> {
    let mut inputs: Vec<&str> = node.inputs.iter().map(String::as_str).collect();
    if inputs.len() == 1 && matches!(node.op_type.as_str(), "Max" | "Min" | "Mean") {
        inputs.push(inputs[0]);
    }

    if node.op_type == "Sub" && inputs.len() == 2 {
        let negated = format!("{}_neg", inputs[1]);
        cx.emit1(
            &format!("{}_neg", node.name),
            inputs[1],
            &negated,
            LayerKind::elementwise(ElementwiseMode::Multiply, Some(-1.0)),
        )?;
        cx.emit(
            &node.name,
            &[inputs[0], negated.as_str()],
            &[node.first_output()],
            LayerKind::elementwise(mode, None),
        )?;
    } else {
        cx.emit(
            &node.name,
            &inputs,
            &[node.first_output()],
            LayerKind::elementwise(mode, None),
        )?;
    }
    cx.broadcast_mapping(node);
    Ok(())
}

/// `Add` / `Sum`; a constant 1-D second operand becomes a bias layer
pub(crate) fn add(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    if let Some(b) = node.input_tensor(1) {
        let squeezed: Vec<usize> = b.shape().iter().copied().filter(|&d| d != 1).collect();
        if node.inputs.len() == 2 && squeezed.len() == 1 {
            cx.emit1(
                &node.name,
                node.first_input(),
                node.first_output(),
                LayerKind::Bias {
                    bias: WeightParams::from_values(b.iter().copied().collect()),
                    shape: squeezed,
                },
            )?;
            cx.keep_mapping(node);
            return Ok(());
        }
    }
    broadcast(cx, node, ElementwiseMode::Add)
}

pub(crate) fn sub(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    broadcast(cx, node, ElementwiseMode::Add)
}

pub(crate) fn mul(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    broadcast(cx, node, ElementwiseMode::Multiply)
}

pub(crate) fn mean(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    broadcast(cx, node, ElementwiseMode::Average)
}

pub(crate) fn max(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    broadcast(cx, node, ElementwiseMode::Max)
}

pub(crate) fn min(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    broadcast(cx, node, ElementwiseMode::Min)
}

/// `a / b` as `a * (1 / b)`
pub(crate) fn div(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(divisor) = node.input(1) else {
        return cx.reject(node, "Div needs two inputs");
    };
    let inverse = format!("{}_inverse", divisor);
    cx.emit1(
        &format!("{}_inverse", node.name),
        divisor,
        &inverse,
        LayerKind::unary(UnaryMode::Inverse),
    )?;
    cx.emit(
        &node.name,
        &[node.first_input(), inverse.as_str()],
        &[node.first_output()],
        LayerKind::elementwise(ElementwiseMode::Multiply, None),
    )?;
    cx.broadcast_mapping(node);
    Ok(())
}

pub(crate) fn neg(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let kind = LayerKind::elementwise(ElementwiseMode::Multiply, Some(-1.0));
    cx.emit1(&node.name, node.first_input(), node.first_output(), kind)?;
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Activations
// ============================================================================

fn activation(cx: &mut LoweringCx<'_>, node: &Node, activation: Activation) -> ConvertResult<()> {
    cx.emit1(
        &node.name,
        node.first_input(),
        node.first_output(),
        LayerKind::activation(activation),
    )?;
    cx.keep_mapping(node);
    Ok(())
}

/// Dropouts left in the graph are inference-mode copies
pub(crate) fn dropout(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::identity())
}

pub(crate) fn relu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::Relu)
}

pub(crate) fn sigmoid(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::Sigmoid)
}

pub(crate) fn tanh(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::Tanh)
}

pub(crate) fn softsign(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::Softsign)
}

pub(crate) fn softplus(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    activation(cx, node, Activation::Softplus)
}

pub(crate) fn thresholded_relu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let alpha = node.attrs.float_or("alpha", 1.0);
    activation(cx, node, Activation::ThresholdedRelu { alpha })
}

pub(crate) fn leaky_relu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let alpha = node.attrs.float_or("alpha", 0.01);
    activation(cx, node, Activation::LeakyRelu { alpha })
}

pub(crate) fn elu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let alpha = node.attrs.float_or("alpha", 1.0);
    activation(cx, node, Activation::Elu { alpha })
}

pub(crate) fn hard_sigmoid(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let alpha = node.attrs.float_or("alpha", 0.2);
    let beta = node.attrs.float_or("beta", 0.5);
    activation(cx, node, Activation::SigmoidHard { alpha, beta })
}

pub(crate) fn prelu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let Some(slope) = node.input_tensor(1) else {
        return cx.reject(node, "Slope must be known!");
    };
    let alpha = WeightParams::from_values(slope.iter().copied().collect());
    activation(cx, node, Activation::Prelu { alpha })
}

/// `gamma * elu(x, alpha)`
pub(crate) fn selu(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let alpha = node.attrs.float_or("alpha", 1.6732);
    let gamma = node.attrs.float_or("gamma", 1.0507);
    let elu_out = format!("{}_elu", node.first_input());
    cx.emit1(
        &format!("{}_elu", node.name),
        node.first_input(),
        &elu_out,
        LayerKind::activation(Activation::Elu { alpha }),
    )?;
    cx.emit1(
        &node.name,
        &elu_out,
        node.first_output(),
        LayerKind::elementwise(ElementwiseMode::Multiply, Some(gamma)),
    )?;
    cx.keep_mapping(node);
    Ok(())
}

/// `2 * (step(x) - 0.5)` with a steep hard sigmoid as the step
pub(crate) fn sign(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let out = node.first_output();
    let step = format!("{}_step", out);
    let half = format!("{}_step_half", out);
    cx.emit1(
        &node.name,
        node.first_input(),
        &step,
        LayerKind::activation(Activation::SigmoidHard {
            alpha: 10000.0,
            beta: 0.0,
        }),
    )?;
    cx.emit1(
        &format!("{}_subtract_half", node.name),
        &step,
        &half,
        LayerKind::elementwise(ElementwiseMode::Add, Some(-0.5)),
    )?;
    cx.emit1(
        &format!("{}_multiply_2", node.name),
        &half,
        out,
        LayerKind::elementwise(ElementwiseMode::Multiply, Some(2.0)),
    )?;
    cx.keep_mapping(node);
    Ok(())
}

/// Softmax over axis 1; `LogSoftmax` appends a log
pub(crate) fn softmax(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let axis = node.attrs.int_or("axis", 1);
    if axis != 1 {
        return cx.reject(node, format!("Unsupported axis {} for softmax", axis));
    }
    if node.op_type == "LogSoftmax" {
        let soft = format!("{}_softmax", node.first_output());
        cx.emit1(
            &format!("{}_softmax", node.name),
            node.first_input(),
            &soft,
            LayerKind::Softmax,
        )?;
        cx.emit1(
            &node.name,
            &soft,
            node.first_output(),
            LayerKind::unary(UnaryMode::Log),
        )?;
    } else {
        cx.emit1(&node.name, node.first_input(), node.first_output(), LayerKind::Softmax)?;
    }
    cx.keep_mapping(node);
    Ok(())
}

// ============================================================================
// Unary math
// ============================================================================

fn unary(cx: &mut LoweringCx<'_>, node: &Node, kind: LayerKind) -> ConvertResult<()> {
    cx.emit1(&node.name, node.first_input(), node.first_output(), kind)?;
    cx.keep_mapping(node);
    Ok(())
}

pub(crate) fn abs(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    unary(cx, node, LayerKind::unary(UnaryMode::Abs))
}

pub(crate) fn exp(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    unary(cx, node, LayerKind::unary(UnaryMode::Exp))
}

pub(crate) fn log(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    unary(cx, node, LayerKind::unary(UnaryMode::Log))
}

pub(crate) fn sqrt(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    unary(cx, node, LayerKind::unary(UnaryMode::Sqrt))
}

pub(crate) fn reciprocal(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    unary(cx, node, LayerKind::unary(UnaryMode::Inverse))
}

/// `x ^ p` for a scalar constant `p`
pub(crate) fn pow(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let exponent = match node.input_tensor(1) {
        Some(t) if t.len() == 1 => t.iter().copied().next().unwrap_or(1.0),
        _ => {
            return cx.missing(
                node,
                "Only mode supported is when the second input is a scalar constant",
            )
        }
    };
    let kind = LayerKind::Unary {
        mode: UnaryMode::Power,
        alpha: exponent,
        shift: 0.0,
        scale: 1.0,
        epsilon: 1e-6,
    };
    unary(cx, node, kind)
}

fn threshold(alpha: f32, scale: f32) -> LayerKind {
    LayerKind::Unary {
        mode: UnaryMode::Threshold,
        alpha,
        shift: 0.0,
        scale,
        epsilon: 1e-6,
    }
}

/// `clip(x, a, b) = -threshold(-threshold(x, a), -b)`
pub(crate) fn clip(cx: &mut LoweringCx<'_>, node: &Node) -> ConvertResult<()> {
    let min = float_attr_or_input(node, "min", 1);
    let max = float_attr_or_input(node, "max", 2);
    let input = node.first_input();
    let output = node.first_output();
    let negated = format!("{}_min_minus_x_minus_b", input);
    let flip = LayerKind::activation(Activation::Linear {
        alpha: -1.0,
        beta: 0.0,
    });

    match (min, max) {
        (min, None) => {
            let floor = min.unwrap_or(-65537.0);
            cx.emit1(&node.name, input, output, threshold(floor, 1.0))?;
        }
        (None, Some(max)) => {
            cx.emit1(
                &format!("{}_min_minus_x_minus_b", node.name),
                input,
                &negated,
                threshold(-max, -1.0),
            )?;
            cx.emit1(&node.name, &negated, output, flip)?;
        }
        (Some(min), Some(max)) => {
            let floored = format!("{}_min_x_a", input);
            cx.emit1(
                &format!("{}_min_x_a", node.name),
                input,
                &floored,
                threshold(min, 1.0),
            )?;
            cx.emit1(
                &format!("{}_min_minus_x_minus_b", node.name),
                &floored,
                &negated,
                threshold(-max, -1.0),
            )?;
            cx.emit1(&node.name, &negated, output, flip)?;
        }
    }
    cx.keep_mapping(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis::*;
    use crate::builder::SpecBuilder;
    use crate::graph::AttrValue;
    use crate::lowering::test_util::{graph, spec};
    use crate::lowering::{Dialect, ErrorHandler};
    use crate::tensor::{scalar, tensor_from_vec};
    use smallvec::smallvec;

    fn lower(node: Node, f: fn(&mut LoweringCx<'_>, &Node) -> ConvertResult<()>) -> crate::builder::NeuralNetworkSpec {
        let mut g = graph(vec![node.clone()], &[1, 3, 4, 4]);
        g.axis_map.insert("x", smallvec![Batch, Channel, Height, Width]);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(false, Dialect::Legacy);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        f(&mut cx, &node).unwrap();
        s
    }

    #[test]
    fn test_sub_negates_second_operand() {
        let s = lower(Node::new("sub", "Sub", &["x", "z"], &["y"]), sub);
        let layers = s.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].name, "sub_neg");
        assert_eq!(layers[0].outputs, vec!["z_neg"]);
        assert_eq!(layers[1].inputs, vec!["x", "z_neg"]);
    }

    #[test]
    fn test_single_input_max_duplicates() {
        let s = lower(Node::new("m", "Max", &["x"], &["y"]), max);
        assert_eq!(s.layers()[0].inputs, vec!["x", "x"]);
    }

    #[test]
    fn test_add_vector_becomes_bias() {
        let b = tensor_from_vec(&[1, 3, 1, 1], vec![1.0, 2.0, 3.0]).unwrap();
        let node = Node::new("add", "Add", &["x", "b"], &["y"]).with_tensor("b", b);
        let s = lower(node, add);
        match &s.layers()[0].kind {
            LayerKind::Bias { shape, bias } => {
                assert_eq!(shape, &vec![3]);
                assert_eq!(bias.values, vec![1.0, 2.0, 3.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clip_both_bounds() {
        let node = Node::new("clip", "Clip", &["x"], &["y"])
            .with_attr("min", AttrValue::Float(0.0))
            .with_attr("max", AttrValue::Float(6.0));
        let s = lower(node, clip);
        let names: Vec<&str> = s.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["clip_min_x_a", "clip_min_minus_x_minus_b", "clip"]);
        match &s.layers()[1].kind {
            LayerKind::Unary { alpha, scale, .. } => {
                assert_eq!(*alpha, -6.0);
                assert_eq!(*scale, -1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pow_needs_scalar_constant() {
        let node = Node::new("p", "Pow", &["x", "e"], &["y"]).with_tensor("e", scalar(2.0));
        let s = lower(node, pow);
        assert!(matches!(
            s.layers()[0].kind,
            LayerKind::Unary { mode: UnaryMode::Power, alpha, .. } if alpha == 2.0
        ));

        let node = Node::new("p", "Pow", &["x", "e"], &["y"]);
        let mut g = graph(vec![node.clone()], &[1, 3, 4, 4]);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(true, Dialect::Legacy);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        assert!(pow(&mut cx, &node).is_err());
    }

    #[test]
    fn test_softmax_axis_and_mapping() {
        let s = lower(Node::new("sm", "LogSoftmax", &["x"], &["y"]), softmax);
        assert_eq!(s.layers().len(), 2);
        assert_eq!(s.layers()[1].name, "sm");

        let node = Node::new("sm", "Softmax", &["x"], &["y"]).with_attr("axis", AttrValue::Int(2));
        let mut g = graph(vec![node.clone()], &[1, 3, 4, 4]);
        let mut s = spec(2);
        let mut err = ErrorHandler::new(false, Dialect::Legacy);
        let mut cx = LoweringCx::new(&mut s, &mut g, &mut err);
        assert!(softmax(&mut cx, &node).is_err());
    }
}
