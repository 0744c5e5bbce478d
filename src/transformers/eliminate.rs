//! Elimination transformers
//!
//! Transformers that remove nodes the target does not need: inference-time
//! no-ops, casts and zero pads on statically shaped edges, input scalers
//! already applied as preprocessing, and dead code.

#![allow(missing_docs)]

use indexmap::IndexMap;
use rustc_hash::FxHashSet;

use crate::error::ConvertResult;
use crate::graph::maps::build_use_count_map;
use crate::graph::{Graph, Node, NodeId};
use crate::tensor::tensor_to_i64;

use super::common::{
    fuse_chains, writes_graph_output, GraphTransformer, NodesFuser, TransformResult,
};

/// Splice out every node matching `pred` and drop it
fn bypass_matching<F>(graph: &mut Graph, pred: F) -> ConvertResult<TransformResult>
where
    F: Fn(&Graph, &Node) -> bool,
{
    let mut result = TransformResult::new();
    let mut removed = FxHashSet::default();

    for id in graph.node_ids().collect::<Vec<_>>() {
        let node = graph.node(id);
        if writes_graph_output(graph, node) || !pred(graph, node) {
            continue;
        }
        result.record_elimination(&node.name);
        graph.bypass_node(id);
        removed.insert(id);
    }
    result.patterns_matched = removed.len();
    graph.remove_nodes(&removed)?;
    Ok(result)
}

/// Eliminate Dropout nodes (inference mode)
///
/// The producer's output edge takes the Dropout's output name, so
/// consumers are untouched. Dropouts whose mask output is read, or whose
/// input is itself a graph output, stay.
#[derive(Debug, Default)]
pub struct EliminateDropout;

impl EliminateDropout {
    pub fn new() -> Self {
        Self
    }
}

impl NodesFuser for EliminateDropout {
    fn num_nodes(&self) -> usize {
        2
    }

    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool {
        let dropout = graph.node(chain[1]);
        if dropout.op_type != "Dropout" || graph.is_graph_output(dropout.first_input()) {
            return false;
        }
        match dropout.outputs.get(1).filter(|m| !m.is_empty()) {
            Some(mask) => graph.consumers(mask).is_empty() && !graph.is_graph_output(mask),
            None => true,
        }
    }

    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>> {
        let dropout = graph.node(chain[1]);
        let (src, dst) = (
            dropout.first_input().to_string(),
            dropout.first_output().to_string(),
        );
        let parent = graph.node_mut(chain[0]);
        for output in parent.outputs.iter_mut().filter(|o| **o == src) {
            *output = dst.clone();
        }
        Ok(vec![chain[0]])
    }
}

impl GraphTransformer for EliminateDropout {
    fn name(&self) -> &'static str {
        "EliminateDropout"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        fuse_chains(self, graph)
    }
}

/// Eliminate Cast nodes on edges with a known static shape
///
/// The target computes in a single float type, so a cast is a no-op once
/// its input is fully described.
#[derive(Debug, Default)]
pub struct EliminateCast;

impl EliminateCast {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for EliminateCast {
    fn name(&self) -> &'static str {
        "EliminateCast"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        bypass_matching(graph, |g, n| {
            n.op_type == "Cast" && g.shape(n.first_input()).is_some()
        })
    }
}

/// Eliminate Pad nodes whose pads are all zero
#[derive(Debug, Default)]
pub struct EliminateZeroPad;

impl EliminateZeroPad {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for EliminateZeroPad {
    fn name(&self) -> &'static str {
        "EliminateZeroPad"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        bypass_matching(graph, |g, n| {
            if n.op_type != "Pad" || g.shape(n.first_input()).is_none() {
                return false;
            }
            let pads = n
                .attrs
                .ints("pads")
                .or_else(|| n.input_tensor(1).map(tensor_to_i64))
                .unwrap_or_default();
            !pads.is_empty() && pads.iter().sum::<i64>() == 0
        })
    }
}

/// Eliminate ImageScaler nodes applied directly to a graph input
///
/// Runs after the scaler's parameters have been moved into input
/// preprocessing.
#[derive(Debug, Default)]
pub struct EliminateImageScaler;

impl EliminateImageScaler {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for EliminateImageScaler {
    fn name(&self) -> &'static str {
        "EliminateImageScaler"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        bypass_matching(graph, |g, n| {
            n.op_type == "ImageScaler" && n.parents.is_empty() && g.is_graph_input(n.first_input())
        })
    }
}

/// Remove nodes none of whose outputs are read, and unread graph inputs
///
/// Nodes are visited in reverse order with reference counting, so a dead
/// chain disappears in a single pass.
#[derive(Debug, Default)]
pub struct EliminateDeadCode;

impl EliminateDeadCode {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for EliminateDeadCode {
    fn name(&self) -> &'static str {
        "EliminateDeadCode"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut uses = build_use_count_map(graph.nodes());
        for output in &graph.outputs {
            *uses.entry(output.name.clone()).or_insert(0) += 1;
        }

        let mut removed = FxHashSet::default();
        for id in graph.node_ids().collect::<Vec<_>>().into_iter().rev() {
            let node = graph.node(id);
            if node.outputs.iter().any(|o| uses.contains_key(o)) {
                continue;
            }
            for input in &node.inputs {
                if let Some(count) = uses.get_mut(input) {
                    *count -= 1;
                    if *count == 0 {
                        uses.remove(input);
                    }
                }
            }
            result.record_elimination(&node.name);
            removed.insert(id);
        }

        let before = graph.inputs.len();
        graph.inputs.retain(|i| uses.contains_key(&i.name));
        result.nodes_eliminated += before - graph.inputs.len();

        result.patterns_matched = removed.len();
        graph.remove_nodes(&removed)?;
        Ok(result)
    }
}

/// Rename node output edges
///
/// Consumers are updated with the producer. Declared graph outputs keep
/// their old names; the caller writes them again afterwards.
#[derive(Debug, Default)]
pub struct RenameOutputs {
    mapping: IndexMap<String, String>,
}

impl RenameOutputs {
    pub fn new(mapping: IndexMap<String, String>) -> Self {
        Self { mapping }
    }
}

impl GraphTransformer for RenameOutputs {
    fn name(&self) -> &'static str {
        "RenameOutputs"
    }

    fn is_applicable(&self, _graph: &Graph) -> bool {
        !self.mapping.is_empty()
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        for (old, new) in &self.mapping {
            if let Some(producer) = graph.producer(old) {
                result.record(&graph.node(producer).name);
                graph.rename_edge(old, new);
            }
        }
        graph.rebuild()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrValue, EdgeInfo, ShapeDict};

    fn graph(nodes: Vec<Node>, shape_dict: ShapeDict) -> Graph {
        Graph::new(
            nodes,
            vec![EdgeInfo::new("x", 1, vec![1, 3, 4, 4])],
            vec![EdgeInfo::new("y", 1, vec![1, 3, 4, 4])],
            shape_dict,
        )
        .unwrap()
    }

    fn known(edge: &str) -> ShapeDict {
        let mut shapes = ShapeDict::default();
        shapes.insert(edge.to_string(), vec![1, 3, 4, 4]);
        shapes
    }

    #[test]
    fn test_eliminate_dropout() {
        let mut g = graph(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("drop", "Dropout", &["a_out"], &["drop_out"]),
                Node::new("b", "Relu", &["drop_out"], &["y"]),
            ],
            ShapeDict::default(),
        );
        let result = EliminateDropout::new().transform(&mut g).unwrap();

        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(g.node_names(), vec!["a", "b"]);
        let a = g.find_node("a").unwrap();
        assert_eq!(g.node(a).outputs, vec!["drop_out"]);
        let b = g.find_node("b").unwrap();
        assert_eq!(g.node(b).parents.as_slice(), &[a]);
        g.verify_adjacency().unwrap();
    }

    #[test]
    fn test_dropout_with_used_mask_kept() {
        let mut g = graph(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("drop", "Dropout", &["a_out"], &["drop_out", "mask"]),
                Node::new("b", "Add", &["drop_out", "mask"], &["y"]),
            ],
            ShapeDict::default(),
        );
        assert!(EliminateDropout::new().transform(&mut g).unwrap().is_empty());
    }

    #[test]
    fn test_dropout_on_graph_output_kept() {
        let mut g = Graph::new(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("drop", "Dropout", &["a_out"], &["y"]),
            ],
            vec![EdgeInfo::new("x", 1, vec![1, 3, 4, 4])],
            vec![
                EdgeInfo::new("a_out", 1, vec![1, 3, 4, 4]),
                EdgeInfo::new("y", 1, vec![1, 3, 4, 4]),
            ],
            ShapeDict::default(),
        )
        .unwrap();
        assert!(EliminateDropout::new().transform(&mut g).unwrap().is_empty());
        assert_eq!(g.node_names(), vec!["a", "drop"]);
        assert!(g.producer("a_out").is_some());
    }

    #[test]
    fn test_eliminate_cast_needs_shape() {
        let nodes = vec![
            Node::new("a", "Relu", &["x"], &["a_out"]),
            Node::new("cast", "Cast", &["a_out"], &["c_out"]),
            Node::new("b", "Relu", &["c_out"], &["y"]),
        ];
        let mut g = graph(nodes.clone(), ShapeDict::default());
        assert!(EliminateCast::new().transform(&mut g).unwrap().is_empty());

        let mut g = graph(nodes, known("a_out"));
        EliminateCast::new().transform(&mut g).unwrap();
        assert_eq!(g.node_names(), vec!["a", "b"]);
        assert_eq!(g.node(NodeId(1)).inputs, vec!["a_out"]);
    }

    #[test]
    fn test_eliminate_zero_pad() {
        let mut g = graph(
            vec![
                Node::new("pad", "Pad", &["x"], &["p"])
                    .with_attr("pads", AttrValue::Ints(vec![0; 8])),
                Node::new("pad2", "Pad", &["p"], &["y"])
                    .with_attr("pads", AttrValue::Ints(vec![0, 0, 1, 1, 0, 0, 1, 1])),
            ],
            known("x"),
        );
        EliminateZeroPad::new().transform(&mut g).unwrap();
        assert_eq!(g.node_names(), vec!["pad2"]);
        assert_eq!(g.node(NodeId(0)).inputs, vec!["x"]);
    }

    #[test]
    fn test_eliminate_image_scaler() {
        let mut g = graph(
            vec![
                Node::new("scale", "ImageScaler", &["x"], &["s"]),
                Node::new("relu", "Relu", &["s"], &["y"]),
            ],
            ShapeDict::default(),
        );
        EliminateImageScaler::new().transform(&mut g).unwrap();
        assert_eq!(g.node_names(), vec!["relu"]);
        assert_eq!(g.node(NodeId(0)).inputs, vec!["x"]);
    }

    #[test]
    fn test_dead_code_elimination() {
        let mut g = Graph::new(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("dead1", "Relu", &["a_out"], &["d1"]),
                Node::new("dead2", "Relu", &["d1"], &["d2"]),
                Node::new("b", "Relu", &["a_out"], &["y"]),
            ],
            vec![
                EdgeInfo::new("x", 1, vec![1]),
                EdgeInfo::new("unused", 1, vec![1]),
            ],
            vec![EdgeInfo::new("y", 1, vec![1])],
            ShapeDict::default(),
        )
        .unwrap();

        let result = EliminateDeadCode::new().transform(&mut g).unwrap();
        assert_eq!(g.node_names(), vec!["a", "b"]);
        assert_eq!(g.inputs.len(), 1);
        assert_eq!(result.nodes_eliminated, 3);

        // Idempotent
        assert!(EliminateDeadCode::new().transform(&mut g).unwrap().is_empty());
    }

    #[test]
    fn test_rename_outputs() {
        let mut g = graph(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("b", "Relu", &["a_out"], &["y"]),
            ],
            ShapeDict::default(),
        );
        let mut mapping = IndexMap::new();
        mapping.insert("y".to_string(), "y_0".to_string());
        RenameOutputs::new(mapping).transform(&mut g).unwrap();

        assert_eq!(g.node(NodeId(1)).outputs, vec!["y_0"]);
        assert!(g.producer("y_0").is_some());
        assert!(g.is_graph_output("y"));
    }
}
