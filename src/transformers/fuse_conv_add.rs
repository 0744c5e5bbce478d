//! Conv + Add fusion transformer
//!
//! Folds a per-channel constant Add into the preceding Conv's bias.

#![allow(missing_docs)]

use ndarray::{ArrayD, IxDyn};

use crate::error::{ConvertError, ConvertResult};
use crate::graph::{Graph, NodeId};

use super::common::{fuse_chains, GraphTransformer, NodesFuser, TransformResult};

/// Fuse Conv + broadcast Add
///
/// Conv: y = W * x + b
/// Add:  z = y + c      (c broadcast over the channel axis)
///
/// Fused: z = W * x + (b + c)
///
/// Only the old-style Add carrying `broadcast=1, axis=1` is matched. A
/// missing conv bias starts from zeros and is written under
/// `"{conv}_bias"`.
#[derive(Debug, Default)]
pub struct FuseConvAdd;

impl FuseConvAdd {
    pub fn new() -> Self {
        Self
    }
}

impl NodesFuser for FuseConvAdd {
    fn num_nodes(&self) -> usize {
        2
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        let (conv, add) = (graph.node(chain[0]), graph.node(chain[1]));
        if conv.op_type != "Conv" || add.op_type != "Add" {
            return false;
        }
        if add.attrs.int("broadcast") != Some(1) || add.attrs.int("axis") != Some(1) {
            return false;
        }
        let Some(weight) = conv.input_tensor(1) else {
            return false;
        };
        if conv.input(2).is_some() && !conv.is_const_input(2) {
            return false;
        }
        if add.input(0) != Some(conv.first_output()) {
            return false;
        }
        let Some(addend) = add.input_tensor(1) else {
            return false;
        };
        let channels = weight.shape().first().copied().unwrap_or(0);
        addend.len() == channels || addend.len() == 1
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        let add = graph.node(chain[1]).clone();
        let addend = add
            .input_tensor(1)
            .cloned()
            .unwrap_or_else(|| ArrayD::zeros(IxDyn(&[1])));

        let conv = graph.node_mut(chain[0]);
        let channels = conv
            .input_tensor(1)
            .and_then(|w| w.shape().first().copied())
            .unwrap_or(0);

        let existing = conv.input(2).map(str::to_string);
        let (bias_name, bias) = match existing {
            Some(name) => {
                let bias = conv
                    .input_tensors
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| ArrayD::zeros(IxDyn(&[channels])));
                (name, bias)
            }
            None => {
                let name = format!("{}_bias", conv.name);
                conv.inputs.truncate(2);
                conv.inputs.push(name.clone());
                (name, ArrayD::zeros(IxDyn(&[channels])))
            }
        };

        let bias = bias
            .into_shape(IxDyn(&[channels]))
            .map_err(|e| ConvertError::Structural(format!("Conv bias: {}", e)))?;
        let flat: Vec<f32> = addend.iter().copied().collect();
        let fused = if flat.len() == 1 {
            bias.mapv(|b| b + flat[0])
        } else {
            let mut out = bias;
            for (b, c) in out.iter_mut().zip(&flat) {
                *b += c;
            }
            out
        };

        conv.input_tensors.insert(bias_name, fused);
        conv.outputs = add.outputs;
        Ok(vec![chain[0]])
    }
}

impl GraphTransformer for FuseConvAdd {
    fn name(&self) -> &'static str {
        "FuseConvAdd"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}
