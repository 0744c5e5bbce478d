//! BatchNormalization + broadcast Mul/Add fusion
//!
//! A per-channel constant multiply or add after a BatchNormalization is
//! folded into the normalization's scale and bias.

#![allow(missing_docs)]

use crate::error::{ConvertError, ConvertResult};
use crate::graph::{Graph, Node, NodeId};
use crate::tensor::{ops, Tensor};

use super::common::{fuse_chains, GraphTransformer, NodesFuser, TransformResult};

/// Constant second operand with exactly one non-unit axis, flattened
fn channel_vector(node: &Node) -> Option<Tensor> {
    if node.inputs.len() != 2 {
        return None;
    }
    let value = node.input_tensor(1)?;
    if value.shape().iter().filter(|&&d| d != 1).count() != 1 {
        return None;
    }
    let len = value.len();
    value.clone().into_shape(ndarray::IxDyn(&[len])).ok()
}

fn bn_eligible(graph: &Graph, chain: &[NodeId], child_op: &str) -> bool {
    let (bn, child) = (graph.node(chain[0]), graph.node(chain[1]));
    bn.op_type == "BatchNormalization"
        && child.op_type == child_op
        && child.input(0) == Some(bn.first_output())
        && bn.is_const_input(1)
        && bn.is_const_input(2)
        && channel_vector(child).is_some()
}

/// Apply `f` to the BN scale and bias, then hand the child's outputs to the BN
fn fold_into_bn<F>(graph: &mut Graph, chain: &[NodeId], f: F) -> ConvertResult<Vec<NodeId>>
where
    F: Fn(&Tensor, &Tensor, &Tensor) -> ConvertResult<(Tensor, Tensor)>,
{
    let child = graph.node(chain[1]).clone();
    let operand = channel_vector(&child).ok_or_else(|| {
        ConvertError::Internal(format!("{}: constant operand vanished", child.name))
    })?;

    let bn = graph.node_mut(chain[0]);
    let (scale, bias) = match (bn.input_tensor(1), bn.input_tensor(2)) {
        (Some(scale), Some(bias)) => f(scale, bias, &operand)?,
        _ => {
            return Err(ConvertError::Internal(format!(
                "{}: scale/bias not constant",
                bn.name
            )))
        }
    };
    let (scale_name, bias_name) = (bn.inputs[1].clone(), bn.inputs[2].clone());
    bn.input_tensors.insert(scale_name, scale);
    bn.input_tensors.insert(bias_name, bias);
    bn.outputs = child.outputs;
    Ok(vec![chain[0]])
}

/// Fuse BatchNormalization + Mul
///
/// BN:  y = scale * x_hat + bias
/// Mul: z = y * w
///
/// Fused: scale' = scale * w, bias' = bias * w
#[derive(Debug, Default)]
pub struct FuseBNBroadcastMul;

impl FuseBNBroadcastMul {
    pub fn new() -> Self {
        Self
    }
}

impl NodesFuser for FuseBNBroadcastMul {
    fn num_nodes(&self) -> usize {
        2
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        bn_eligible(graph, chain, "Mul")
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        fold_into_bn(graph, chain, |scale, bias, w| {
            Ok((ops::mul(scale, w)?, ops::mul(bias, w)?))
        })
    }
}

impl GraphTransformer for FuseBNBroadcastMul {
    fn name(&self) -> &'static str {
        "FuseBNBroadcastMul"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}

/// Fuse BatchNormalization + Add
///
/// Fused: bias' = bias + b
#[derive(Debug, Default)]
pub struct FuseBNBroadcastAdd;

impl FuseBNBroadcastAdd {
    pub fn new() -> Self {
        Self
    }
}

impl NodesFuser for FuseBNBroadcastAdd {
    fn num_nodes(&self) -> usize {
        2
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        bn_eligible(graph, chain, "Add")
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        fold_into_bn(graph, chain, |scale, bias, b| {
            if !ops::is_broadcastable(bias.shape(), b.shape()) {
                return Err(ConvertError::Structural(format!(
                    "BatchNormalization bias {:?} vs addend {:?}",
                    bias.shape(),
                    b.shape()
                )));
            }
            Ok((scale.clone(), bias + b))
        })
    }
}

impl GraphTransformer for FuseBNBroadcastAdd {
    fn name(&self) -> &'static str {
        "FuseBNBroadcastAdd"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}
