//! Graph mutation operations
//!
//! Edge-level edits used by passes. None of these rebuild the graph; the
//! calling pass rebuilds once at its boundary.

use crate::tensor::Tensor;

use super::ir::Graph;
use super::node::NodeId;

impl Graph {
    // ========================================================================
    // Splicing
    // ========================================================================

    /// Reroute the consumers of a single-input/single-output node to its input
    ///
    /// Consumers that read the node's output now read its input instead; a
    /// known constant on that input travels with it. The node itself stays
    /// in the arena until the caller removes it.
    pub fn bypass_node(&mut self, id: NodeId) {
        let node = self.node(id);
        let (Some(src), Some(dst)) = (node.inputs.first().cloned(), node.outputs.first().cloned())
        else {
            return;
        };
        let carried = node.input_tensors.get(&src).cloned();
        let children = node.children.clone();

        for child in children {
            let child = self.node_mut(child);
            if let Some(slot) = child.inputs.iter_mut().find(|i| **i == dst) {
                *slot = src.clone();
                if let Some(value) = &carried {
                    child.input_tensors.insert(src.clone(), value.clone());
                }
            }
        }
    }

    /// Hand a folded value to every consumer of `edge`
    pub fn feed_constant(&mut self, producer: NodeId, edge: &str, value: &Tensor) {
        let children = self.node(producer).children.clone();
        for child in children {
            self.node_mut(child)
                .input_tensors
                .insert(edge.to_string(), value.clone());
        }
    }

    /// Rename an edge on its producer and every consumer
    ///
    /// Declared graph outputs keep their names; the caller is expected to
    /// write the old name again (e.g. with a post-processing layer).
    pub fn rename_edge(&mut self, old: &str, new: &str) {
        for node in self.nodes_mut() {
            for output in node.outputs.iter_mut().filter(|o| o.as_str() == old) {
                *output = new.to_string();
            }
            for input in node.inputs.iter_mut().filter(|i| i.as_str() == old) {
                *input = new.to_string();
            }
            if let Some(value) = node.input_tensors.remove(old) {
                node.input_tensors.insert(new.to_string(), value);
            }
        }
    }
}
