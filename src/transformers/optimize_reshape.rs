//! Rank-6 Reshape → Transpose → Reshape rewrites
//!
//! The target's reshape and permute layers stop at rank 4. Two common
//! rank-6 shuffles (adjacent-block transposes and pixel shuffle) can be
//! expressed through rank-4 intermediates instead.

#![allow(missing_docs)]

use crate::error::{ConvertError, ConvertResult};
use crate::graph::{AttrValue, Graph, Node, NodeId};
use crate::tensor::{is_static, tensor_from_vec, tensor_to_i64};

use super::common::{fuse_chains, GraphTransformer, NodesFuser, TransformResult};

const PIXEL_SHUFFLE_PERM: [i64; 6] = [0, 1, 4, 2, 5, 3];

/// Static target shape of a two-input Reshape
///
/// A `-1` in the constant is resolved from `shape_dict` when the output
/// shape is already known.
fn reshape_target(graph: &Graph, node: &Node) -> Option<Vec<i64>> {
    if node.op_type != "Reshape" || node.inputs.len() != 2 {
        return None;
    }
    let shape = tensor_to_i64(node.input_tensor(1)?);
    if shape.contains(&-1) {
        if let Some(known) = graph.shape(node.first_output()).filter(|s| is_static(s)) {
            return Some(known.to_vec());
        }
    }
    Some(shape)
}

/// Leading shape and perm of a rank-6 → rank-4 Reshape/Transpose/Reshape
fn rank6_chain(graph: &Graph, chain: &[NodeId]) -> Option<(Vec<i64>, Vec<i64>)> {
    let (first, transpose, last) = (
        graph.node(chain[0]),
        graph.node(chain[1]),
        graph.node(chain[2]),
    );
    if transpose.op_type != "Transpose" {
        return None;
    }
    let shape = reshape_target(graph, first)?;
    let final_shape = reshape_target(graph, last)?;
    if shape.len() != 6 || shape[0] != 1 || final_shape.len() != 4 {
        return None;
    }
    let perm = transpose.attrs.ints("perm")?;
    if perm.len() != 6 || perm[0] != 0 {
        return None;
    }
    Some((shape, perm))
}

fn shape_tensor(values: &[i64]) -> ConvertResult<crate::tensor::Tensor> {
    tensor_from_vec(&[values.len()], values.iter().map(|&v| v as f32).collect())
}

fn shape_input_name(node: &Node) -> ConvertResult<String> {
    node.input(1)
        .map(str::to_string)
        .ok_or_else(|| ConvertError::Internal(format!("{}: Reshape shape input vanished", node.name)))
}

/// Merge the first adjacent pair of a rank-5 permutation
///
/// `shape` and `perm` describe the transpose without its leading unit
/// axis. Returns the rank-4 shape and perm that move the same data.
pub fn collapse_adjacent_pair(shape: &[i64], perm: &[i64]) -> Option<(Vec<i64>, Vec<i64>)> {
    if shape.len() != 5 || perm.len() != 5 {
        return None;
    }
    let mut seen = [false; 5];
    for &p in perm {
        let p = usize::try_from(p).ok().filter(|&p| p < 5)?;
        if std::mem::replace(&mut seen[p], true) {
            return None;
        }
    }
    let pair = perm.windows(2).position(|w| w[1] - w[0] == 1)?;
    let start = perm[pair] as usize;

    // Axes after the merged pair move down by one
    let remap = |axis: usize| if axis > start { axis - 1 } else { axis };

    let mut new_shape = vec![1i64; 4];
    for axis in 0..5 {
        if axis == start + 1 {
            continue;
        }
        new_shape[remap(axis)] = if axis == start {
            shape[start] * shape[start + 1]
        } else {
            shape[axis]
        };
    }
    let new_perm = perm
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != pair + 1)
        .map(|(_, &p)| remap(p as usize) as i64)
        .collect();
    Some((new_shape, new_perm))
}

/// Collapse a rank-6 transpose that keeps two axes adjacent
///
/// `Reshape(rank 6) → Transpose → Reshape(rank 4)` with a leading unit
/// axis and one adjacent pair in the perm becomes the same chain at rank 4.
#[derive(Debug, Default)]
pub struct FuseReshapeTransposeReshape;

impl FuseReshapeTransposeReshape {
    pub fn new() -> Self {
        Self
    }

    fn plan(&self, graph: &Graph, chain: &[NodeId]) -> Option<(Vec<i64>, Vec<i64>)> {
        let (shape, perm) = rank6_chain(graph, chain)?;
        let inner: Vec<i64> = perm[1..].iter().map(|p| p - 1).collect();
        collapse_adjacent_pair(&shape[1..], &inner)
    }
}

impl NodesFuser for FuseReshapeTransposeReshape {
    fn num_nodes(&self) -> usize {
        3
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        self.plan(graph, chain).is_some()
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        let (new_shape, new_perm) = self
            .plan(graph, chain)
            .ok_or_else(|| ConvertError::Internal("rank-6 chain no longer eligible".to_string()))?;

        let reshape = graph.node_mut(chain[0]);
        let shape_name = shape_input_name(reshape)?;
        reshape.input_tensors.insert(shape_name, shape_tensor(&new_shape)?);
        let reshaped = reshape.first_output().to_string();

        let transpose = graph.node_mut(chain[1]);
        transpose
            .attrs
            .insert("perm", AttrValue::Ints(new_perm.clone()));
        let transposed = transpose.first_output().to_string();

        let permuted = new_perm.iter().map(|&p| new_shape[p as usize]).collect();
        graph.record_shape(&reshaped, new_shape);
        graph.record_shape(&transposed, permuted);
        Ok(chain.to_vec())
    }
}

impl GraphTransformer for FuseReshapeTransposeReshape {
    fn name(&self) -> &'static str {
        "FuseReshapeTransposeReshape"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}

/// Rewrite a rank-6 pixel shuffle as two rank-4 reshape/transpose steps
///
/// ```text
/// [1,x1,x2,x3,x4,x5] --perm [0,1,4,2,5,3]--> final Reshape
/// ```
///
/// becomes
///
/// ```text
/// Reshape [x1,x2,x3,x4*x5] → Transpose [0,3,1,2]
///   → Reshape [x1*x4,x5,x2,x3] → Transpose [0,2,1,3] → final Reshape
/// ```
#[derive(Debug, Default)]
pub struct FusePixelShuffle;

impl FusePixelShuffle {
    pub fn new() -> Self {
        Self
    }
}

impl NodesFuser for FusePixelShuffle {
    fn num_nodes(&self) -> usize {
        3
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        matches!(rank6_chain(graph, chain), Some((_, perm)) if perm == PIXEL_SHUFFLE_PERM)
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        let (shape, _) = rank6_chain(graph, chain)
            .ok_or_else(|| ConvertError::Internal("pixel shuffle no longer eligible".to_string()))?;
        let (x1, x2, x3, x4, x5) = (shape[1], shape[2], shape[3], shape[4], shape[5]);

        let final_name = graph.node(chain[2]).name.clone();
        let reshape_name = format!("{}_pixel_shuffle_reshape", final_name);
        let transpose_name = format!("{}_pixel_shuffle_transpose", final_name);

        let mut added = 0;
        let mut unique = |graph: &Graph, base: &str| {
            added += 1;
            graph.get_unique_edge_name(&format!("{}_{}", base, added))
        };

        let first_shape = vec![x1, x2, x3, x4 * x5];
        let reshape = graph.node_mut(chain[0]);
        let shape_name = shape_input_name(reshape)?;
        reshape.input_tensors.insert(shape_name, shape_tensor(&first_shape)?);
        let reshaped = reshape.first_output().to_string();

        let transposed = unique(graph, &transpose_name);
        let transpose = graph.node_mut(chain[1]);
        transpose
            .attrs
            .insert("perm", AttrValue::Ints(vec![0, 3, 1, 2]));
        transpose.outputs = vec![transposed.clone()];

        let second_shape = vec![x1 * x4, x5, x2, x3];
        let second_shape_name = unique(graph, &reshape_name);
        let second_reshaped = unique(graph, &reshape_name);
        let second_reshape = Node::new(
            reshape_name,
            "Reshape",
            &[transposed.as_str(), second_shape_name.as_str()],
            &[second_reshaped.as_str()],
        )
        .with_tensor(&second_shape_name, shape_tensor(&second_shape)?);

        let second_transposed = unique(graph, &transpose_name);
        let second_transpose = Node::new(
            transpose_name,
            "Transpose",
            &[second_reshaped.as_str()],
            &[second_transposed.as_str()],
        )
        .with_attr("perm", AttrValue::Ints(vec![0, 2, 1, 3]));

        let final_reshape = graph.node_mut(chain[2]);
        match final_reshape.inputs.first_mut() {
            Some(input) => *input = second_transposed.clone(),
            None => final_reshape.inputs.push(second_transposed.clone()),
        }

        graph.record_shape(&reshaped, first_shape);
        graph.record_shape(&transposed, vec![x1, x4 * x5, x2, x3]);
        graph.record_shape(&second_reshaped, second_shape);
        graph.record_shape(&second_transposed, vec![x1 * x4, x2, x5, x3]);

        let second_reshape = graph.add_node(second_reshape);
        let second_transpose = graph.add_node(second_transpose);
        Ok(vec![
            chain[0],
            chain[1],
            second_reshape,
            second_transpose,
            chain[2],
        ])
    }
}

impl GraphTransformer for FusePixelShuffle {
    fn name(&self) -> &'static str {
        "FusePixelShuffle"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}
