//! The graph value passes operate on
//!
//! A [`Graph`] owns an arena of [`Node`]s plus the edge-keyed side tables
//! lowering needs. Every structural edit ends with a rebuild, which
//! recomputes adjacency and the producer/consumer indices from edge names
//! and rejects edges with more than one producer.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::axis::AxisMap;
use crate::error::{ConvertError, ConvertResult};

use super::maps::{
    build_consumer_map, build_producer_map, collect_edge_names, BlobFromOpType, BlobToOpType,
    ConsumerMap, ProducerMap, ShapeDict,
};
use super::node::{Node, NodeId};

/// Declared graph input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeInfo {
    /// Edge name
    pub name: String,
    /// ONNX element type (`TensorProto.DataType` value)
    pub elem_type: i32,
    /// Declared shape, `-1` for unknown dims
    pub shape: Vec<i64>,
}

impl EdgeInfo {
    /// Create an edge descriptor
    pub fn new(name: impl Into<String>, elem_type: i32, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            elem_type,
            shape,
        }
    }
}

/// Op graph with derived indices
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Declared model inputs (initializers excluded)
    pub inputs: Vec<EdgeInfo>,
    /// Declared model outputs
    pub outputs: Vec<EdgeInfo>,
    /// Static shapes known for edges
    pub shape_dict: ShapeDict,
    /// Per-edge canonical axis assignment (legacy lowering only)
    pub axis_map: AxisMap,
    /// Edge → consumer op types
    pub blob_to_op_type: BlobToOpType,
    /// Edge → producer op type
    pub blob_from_op_type: BlobFromOpType,
    /// Inputs exposed only as optional features (recurrent state)
    pub optional_inputs: Vec<EdgeInfo>,
    /// Outputs exposed only as optional features (recurrent state)
    pub optional_outputs: Vec<EdgeInfo>,
    /// Constant edges already emitted as load-constant layers
    pub constants_loaded: FxHashSet<String>,
    producers: ProducerMap,
    consumers: ConsumerMap,
}

impl Graph {
    /// Build a graph and its indices
    pub fn new(
        nodes: Vec<Node>,
        inputs: Vec<EdgeInfo>,
        outputs: Vec<EdgeInfo>,
        shape_dict: ShapeDict,
    ) -> ConvertResult<Self> {
        let mut graph = Self {
            nodes,
            inputs,
            outputs,
            shape_dict,
            ..Default::default()
        };
        graph.rebuild()?;
        Ok(graph)
    }

    /// Same graph metadata over a new node list
    pub fn with_nodes(mut self, nodes: Vec<Node>) -> ConvertResult<Self> {
        self.nodes = nodes;
        self.rebuild()?;
        Ok(self)
    }

    /// Drop nodes failing the predicate, then rebuild
    pub fn retain_nodes<F>(&mut self, mut keep: F) -> ConvertResult<usize>
    where
        F: FnMut(&Node) -> bool,
    {
        let before = self.nodes.len();
        self.nodes.retain(|n| keep(n));
        self.rebuild()?;
        Ok(before - self.nodes.len())
    }

    /// Drop the nodes with the given ids, then rebuild
    pub fn remove_nodes(&mut self, ids: &FxHashSet<NodeId>) -> ConvertResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let before = self.nodes.len();
        let mut index = 0;
        self.nodes.retain(|_| {
            let keep = !ids.contains(&NodeId(index));
            index += 1;
            keep
        });
        self.rebuild()?;
        Ok(before - self.nodes.len())
    }

    /// Keep exactly the listed nodes, in the listed order, then rebuild
    pub fn reorder_nodes(&mut self, order: &[NodeId]) -> ConvertResult<()> {
        let mut slots: Vec<Option<Node>> = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(Some)
            .collect();
        self.nodes = order
            .iter()
            .filter_map(|id| slots.get_mut(id.0).and_then(Option::take))
            .collect();
        self.rebuild()
    }

    /// Recompute adjacency and edge indices from edge names
    pub fn rebuild(&mut self) -> ConvertResult<()> {
        self.producers = build_producer_map(&self.nodes)?;
        self.consumers = build_consumer_map(&self.nodes);

        for node in &mut self.nodes {
            node.parents.clear();
            node.children.clear();
        }
        for i in 0..self.nodes.len() {
            let parents: Vec<NodeId> = self.nodes[i]
                .inputs
                .iter()
                .filter_map(|input| self.producers.get(input).copied())
                .filter(|p| p.0 != i)
                .collect();
            for p in parents {
                self.nodes[i].add_parent(p);
                self.nodes[p.0].add_child(NodeId(i));
            }
        }

        self.rebuild_op_type_maps();
        Ok(())
    }

    fn rebuild_op_type_maps(&mut self) {
        let mut to_op: BlobToOpType = FxHashMap::default();
        let mut from_op: BlobFromOpType = FxHashMap::default();
        for node in &self.nodes {
            for input in node.inputs.iter().filter(|s| !s.is_empty()) {
                to_op
                    .entry(input.clone())
                    .or_default()
                    .push(node.op_type.clone());
            }
            for output in node.outputs.iter().filter(|s| !s.is_empty()) {
                from_op.insert(output.clone(), node.op_type.clone());
            }
        }

        // Entries registered for declared I/O that no node touches (recurrent
        // state exposed by a pass) survive the rebuild.
        for (edge, ops) in self.blob_to_op_type.drain() {
            if !to_op.contains_key(&edge) && self.inputs.iter().any(|i| i.name == edge) {
                to_op.insert(edge, ops);
            }
        }
        for (edge, op) in self.blob_from_op_type.drain() {
            if !from_op.contains_key(&edge) && self.outputs.iter().any(|o| o.name == edge) {
                from_op.insert(edge, op);
            }
        }

        self.blob_to_op_type = to_op;
        self.blob_from_op_type = from_op;
    }

    // ========================================================================
    // Node accessors
    // ========================================================================

    /// All nodes in traversal order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Mutable node list. Call [`Graph::rebuild`] after structural edits.
    pub fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    /// Consume the graph, returning its nodes
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// Node by id
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Mutable node by id
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Ids of all nodes in order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Append a node to the arena without rebuilding
    pub fn add_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Find a node by name
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    /// Node names, in order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ========================================================================
    // Edge accessors
    // ========================================================================

    /// Producer of an edge
    pub fn producer(&self, edge: &str) -> Option<NodeId> {
        self.producers.get(edge).copied()
    }

    /// Consumers of an edge
    pub fn consumers(&self, edge: &str) -> &[NodeId] {
        self.consumers.get(edge).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Whether the edge is a declared model input
    pub fn is_graph_input(&self, edge: &str) -> bool {
        self.inputs.iter().any(|i| i.name == edge)
    }

    /// Whether the edge is a declared model output
    pub fn is_graph_output(&self, edge: &str) -> bool {
        self.outputs.iter().any(|o| o.name == edge)
    }

    /// Declared output names
    pub fn output_names(&self) -> FxHashSet<String> {
        self.outputs.iter().map(|o| o.name.clone()).collect()
    }

    /// Known static shape of an edge
    pub fn shape(&self, edge: &str) -> Option<&[i64]> {
        self.shape_dict.get(edge).map(Vec::as_slice)
    }

    /// Known rank of an edge
    pub fn rank(&self, edge: &str) -> Option<usize> {
        self.shape_dict.get(edge).map(Vec::len)
    }

    /// Record a shape discovered by a pass
    ///
    /// Unknown dims are refined. A conflicting known dim means the producer
    /// was replaced, and the new shape wins.
    pub fn record_shape(&mut self, edge: &str, shape: Vec<i64>) {
        match self.shape_dict.get_mut(edge) {
            Some(existing) if existing.len() == shape.len() => {
                for (old, new) in existing.iter_mut().zip(&shape) {
                    if *old < 0 {
                        *old = *new;
                    } else if *new >= 0 && old != new {
                        debug!(edge, ?shape, "shape replaced by folded value");
                        *old = *new;
                    }
                }
            }
            Some(existing) => {
                debug!(edge, old = ?existing, new = ?shape, "shape replaced by folded value");
                *existing = shape;
            }
            None => {
                self.shape_dict.insert(edge.to_string(), shape);
            }
        }
    }

    /// Whether any node, declared I/O or shape entry uses this edge name
    pub fn has_edge_name(&self, name: &str) -> bool {
        collect_edge_names(&self.nodes).contains(name)
            || self.inputs.iter().any(|i| i.name == name)
            || self.outputs.iter().any(|o| o.name == name)
            || self.shape_dict.contains_key(name)
    }

    /// `name`, or `name_0`, `name_1`, ... until unused
    pub fn get_unique_edge_name(&self, name: &str) -> String {
        let used = collect_edge_names(&self.nodes);
        let taken = |candidate: &str| {
            used.contains(candidate)
                || self.inputs.iter().any(|i| i.name == candidate)
                || self.outputs.iter().any(|o| o.name == candidate)
                || self.shape_dict.contains_key(candidate)
        };

        let mut candidate = name.to_string();
        let mut i = 0;
        while taken(&candidate) {
            candidate = format!("{}_{}", name, i);
            i += 1;
        }
        candidate
    }

    /// Check the adjacency invariant (parents and children are mutual)
    pub fn verify_adjacency(&self) -> ConvertResult<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            for p in &node.parents {
                if !self.nodes[p.0].children.contains(&NodeId(i)) {
                    return Err(ConvertError::Structural(format!(
                        "'{}' lists '{}' as parent but is not its child",
                        node.name, self.nodes[p.0].name
                    )));
                }
            }
            for c in &node.children {
                if !self.nodes[c.0].parents.contains(&NodeId(i)) {
                    return Err(ConvertError::Structural(format!(
                        "'{}' lists '{}' as child but is not its parent",
                        node.name, self.nodes[c.0].name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        Graph::new(
            vec![
                Node::new("a", "Relu", &["x"], &["a_out"]),
                Node::new("b", "Sigmoid", &["a_out"], &["b_out"]),
                Node::new("c", "Add", &["a_out", "b_out"], &["y"]),
            ],
            vec![EdgeInfo::new("x", 1, vec![1, 3])],
            vec![EdgeInfo::new("y", 1, vec![1, 3])],
            ShapeDict::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_adjacency_is_mutual() {
        let graph = chain();
        graph.verify_adjacency().unwrap();

        let c = graph.find_node("c").unwrap();
        assert_eq!(graph.node(c).parents.len(), 2);
        assert_eq!(graph.node(NodeId(0)).children.len(), 2);
        assert!(graph.node(c).children.is_empty());
    }

    #[test]
    fn test_op_type_maps() {
        let graph = chain();
        assert_eq!(graph.blob_to_op_type["a_out"], vec!["Sigmoid", "Add"]);
        assert_eq!(graph.blob_from_op_type["b_out"], "Sigmoid");
        assert_eq!(graph.blob_to_op_type["x"], vec!["Relu"]);
    }

    #[test]
    fn test_retain_rebuilds() {
        let mut graph = chain();
        let removed = graph.retain_nodes(|n| n.name != "b").unwrap();
        assert_eq!(removed, 1);
        assert!(graph.producer("b_out").is_none());
        assert_eq!(graph.node(NodeId(0)).children.len(), 1);
        graph.verify_adjacency().unwrap();
    }

    #[test]
    fn test_remove_and_reorder() {
        let mut graph = chain();
        let mut ids = FxHashSet::default();
        ids.insert(NodeId(1));
        assert_eq!(graph.remove_nodes(&ids).unwrap(), 1);
        assert_eq!(graph.node_names(), vec!["a", "c"]);

        graph.reorder_nodes(&[NodeId(1), NodeId(0)]).unwrap();
        assert_eq!(graph.node_names(), vec!["c", "a"]);
        graph.verify_adjacency().unwrap();
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let result = Graph::new(
            vec![
                Node::new("a", "Relu", &["x"], &["y"]),
                Node::new("b", "Relu", &["x"], &["y"]),
            ],
            vec![],
            vec![],
            ShapeDict::default(),
        );
        assert!(matches!(result, Err(ConvertError::Structural(_))));
    }

    #[test]
    fn test_unique_edge_name() {
        let graph = chain();
        assert_eq!(graph.get_unique_edge_name("z"), "z");
        assert_eq!(graph.get_unique_edge_name("a_out"), "a_out_0");
        assert_eq!(graph.get_unique_edge_name("y"), "y_0");
    }

    #[test]
    fn test_record_shape_refines_unknown() {
        let mut graph = chain();
        graph.record_shape("a_out", vec![-1, 3]);
        graph.record_shape("a_out", vec![2, 3]);
        assert_eq!(graph.shape("a_out"), Some(&[2, 3][..]));
    }

    #[test]
    fn test_declared_io_op_types_survive_rebuild() {
        let mut graph = chain();
        graph.inputs.push(EdgeInfo::new("h0", 1, vec![8]));
        graph
            .blob_to_op_type
            .insert("h0".to_string(), vec!["LSTM".to_string()]);
        graph.rebuild().unwrap();
        assert_eq!(graph.blob_to_op_type["h0"], vec!["LSTM"]);
    }
}
