//! IR node
//!
//! Nodes live in the graph's arena and reference each other by [`NodeId`].
//! Adjacency is derived from edge names and recomputed whenever the graph
//! is rebuilt, so passes only need to keep names consistent.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::tensor::Tensor;

use super::attrs::{AttrValue, Attributes};

/// Stable index of a node inside one graph value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Position in the arena
    pub fn index(self) -> usize {
        self.0
    }
}

/// Adjacency list; most nodes have at most a handful of neighbours
pub type NodeIds = SmallVec<[NodeId; 4]>;

/// A single op in the graph
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Unique node name
    pub name: String,
    /// ONNX op type
    pub op_type: String,
    /// Decoded attributes
    pub attrs: Attributes,
    /// Input edge names (may contain empty strings for skipped optionals)
    pub inputs: Vec<String>,
    /// Output edge names
    pub outputs: Vec<String>,
    /// Inputs whose value is known at compile time
    pub input_tensors: FxHashMap<String, Tensor>,
    /// Producers of this node's inputs
    pub parents: NodeIds,
    /// Consumers of this node's outputs
    pub children: NodeIds,
}

impl Node {
    /// Create a node with no attributes
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: &[S],
        outputs: &[S],
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs: inputs.iter().map(|s| s.as_ref().to_string()).collect(),
            outputs: outputs.iter().map(|s| s.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter
    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attrs.insert(key, value);
        self
    }

    /// Builder-style constant input
    pub fn with_tensor(mut self, edge: &str, value: Tensor) -> Self {
        self.input_tensors.insert(edge.to_string(), value);
        self
    }

    /// Constant value of input `i`, if known
    pub fn input_tensor(&self, i: usize) -> Option<&Tensor> {
        self.inputs.get(i).and_then(|name| self.input_tensors.get(name))
    }

    /// Whether input `i` exists and is a compile-time constant
    pub fn is_const_input(&self, i: usize) -> bool {
        self.input_tensor(i).is_some()
    }

    /// Input `i`, treating empty names as absent
    pub fn input(&self, i: usize) -> Option<&str> {
        self.inputs
            .get(i)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// First input edge
    pub fn first_input(&self) -> &str {
        self.inputs.first().map(String::as_str).unwrap_or("")
    }

    /// First output edge
    pub fn first_output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or("")
    }

    /// The only parent, if there is exactly one
    pub fn only_parent(&self) -> Option<NodeId> {
        match self.parents.as_slice() {
            [p] => Some(*p),
            _ => None,
        }
    }

    /// Add a parent link (idempotent)
    pub fn add_parent(&mut self, id: NodeId) {
        if !self.parents.contains(&id) {
            self.parents.push(id);
        }
    }

    /// Add a child link (idempotent)
    pub fn add_child(&mut self, id: NodeId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor_from_vec;

    #[test]
    fn test_const_input_lookup() {
        let w = tensor_from_vec(&[2], vec![1.0, 2.0]).unwrap();
        let node = Node::new("conv", "Conv", &["x", "w"], &["y"]).with_tensor("w", w);
        assert!(!node.is_const_input(0));
        assert!(node.is_const_input(1));
        assert!(!node.is_const_input(2));
    }

    #[test]
    fn test_empty_optional_input() {
        let node = Node::new("lstm", "LSTM", &["x", "w", "r", "", "", "h0"], &["y"]);
        assert_eq!(node.input(3), None);
        assert_eq!(node.input(5), Some("h0"));
    }

    #[test]
    fn test_links_are_idempotent() {
        let mut node = Node::new("a", "Relu", &["x"], &["y"]);
        node.add_parent(NodeId(3));
        node.add_parent(NodeId(3));
        assert_eq!(node.only_parent(), Some(NodeId(3)));
    }
}
