//! Graph map types and builders
//!
//! Edge-keyed indices over the node arena. They are rebuilt from scratch
//! every time a graph value is constructed.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::error::{ConvertError, ConvertResult};

use super::node::{Node, NodeId};

/// Edge name → producing node
pub type ProducerMap = FxHashMap<String, NodeId>;

/// Edge name → consuming nodes, in node order
pub type ConsumerMap = FxHashMap<String, SmallVec<[NodeId; 4]>>;

/// Edge name → static shape (`-1` for unknown dims)
pub type ShapeDict = FxHashMap<String, Vec<i64>>;

/// Edge name → op types of its consumers
pub type BlobToOpType = FxHashMap<String, Vec<String>>;

/// Edge name → op type of its producer
pub type BlobFromOpType = FxHashMap<String, String>;

/// Edge name → reference count
pub type UseCountMap = FxHashMap<String, usize>;

/// Build the producer map
///
/// Fails if two nodes write the same edge.
pub fn build_producer_map(nodes: &[Node]) -> ConvertResult<ProducerMap> {
    let mut map = FxHashMap::default();

    for (i, node) in nodes.iter().enumerate() {
        for output in node.outputs.iter().filter(|o| !o.is_empty()) {
            if let Some(prev) = map.insert(output.clone(), NodeId(i)) {
                return Err(ConvertError::Structural(format!(
                    "Edge '{}' is produced by both '{}' and '{}'",
                    output, nodes[prev.0].name, node.name
                )));
            }
        }
    }

    Ok(map)
}

/// Build the consumer map
pub fn build_consumer_map(nodes: &[Node]) -> ConsumerMap {
    let mut map: ConsumerMap = FxHashMap::default();

    for (i, node) in nodes.iter().enumerate() {
        for input in node.inputs.iter().filter(|s| !s.is_empty()) {
            let entry = map.entry(input.clone()).or_default();
            if !entry.contains(&NodeId(i)) {
                entry.push(NodeId(i));
            }
        }
    }

    map
}

/// Reference counts of every edge read by a node
pub fn build_use_count_map(nodes: &[Node]) -> UseCountMap {
    let mut map: UseCountMap = FxHashMap::default();

    for node in nodes {
        for input in &node.inputs {
            *map.entry(input.clone()).or_insert(0) += 1;
        }
    }

    map
}

/// Every edge name mentioned by a node
pub fn collect_edge_names(nodes: &[Node]) -> FxHashSet<&str> {
    nodes
        .iter()
        .flat_map(|n| n.inputs.iter().chain(n.outputs.iter()))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_nodes() -> Vec<Node> {
        vec![
            Node::new("conv_0", "Conv", &["X", "W"], &["conv_out"]),
            Node::new(
                "bn_0",
                "BatchNormalization",
                &["conv_out", "scale", "B", "mean", "var"],
                &["bn_out"],
            ),
            Node::new("relu_0", "Relu", &["bn_out"], &["Y"]),
        ]
    }

    #[test]
    fn test_build_producer_map() {
        let map = build_producer_map(&make_test_nodes()).unwrap();

        assert_eq!(map.get("conv_out"), Some(&NodeId(0)));
        assert_eq!(map.get("bn_out"), Some(&NodeId(1)));
        assert_eq!(map.get("Y"), Some(&NodeId(2)));
        assert!(map.get("X").is_none());
    }

    #[test]
    fn test_duplicate_producer_is_structural() {
        let mut nodes = make_test_nodes();
        nodes.push(Node::new("relu_1", "Relu", &["X"], &["bn_out"]));

        let err = build_producer_map(&nodes).unwrap_err();
        assert!(matches!(err, ConvertError::Structural(_)));
        assert!(err.to_string().contains("bn_out"));
    }

    #[test]
    fn test_build_consumer_map() {
        let map = build_consumer_map(&make_test_nodes());

        assert_eq!(map.get("conv_out").map(|v| v.as_slice()), Some(&[NodeId(1)][..]));
        assert_eq!(map.get("bn_out").map(|v| v.as_slice()), Some(&[NodeId(2)][..]));
    }

    #[test]
    fn test_build_use_count_map() {
        let map = build_use_count_map(&make_test_nodes());

        assert_eq!(map.get("conv_out"), Some(&1));
        assert_eq!(map.get("X"), Some(&1));
        assert!(map.get("Y").is_none());
    }
}
