//! Common utilities for transformers
//!
//! The pass trait, its statistics type, and the driver shared by every
//! fixed-length chain fuser.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::error::ConvertResult;
use crate::graph::{Graph, Node, NodeId, NodeIds};

/// Transformation result for statistics
#[derive(Debug, Default, Clone)]
pub struct TransformResult {
    /// Number of patterns matched
    pub patterns_matched: usize,
    /// Number of transformations applied
    pub transforms_applied: usize,
    /// Number of nodes eliminated
    pub nodes_eliminated: usize,
    /// Names of transformed nodes
    pub transformed_nodes: Vec<String>,
}

impl TransformResult {
    /// Create empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful transformation
    pub fn record(&mut self, node_name: &str) {
        self.transforms_applied += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Record elimination
    pub fn record_elimination(&mut self, node_name: &str) {
        self.nodes_eliminated += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Merge with another result
    pub fn merge(&mut self, other: TransformResult) {
        self.patterns_matched += other.patterns_matched;
        self.transforms_applied += other.transforms_applied;
        self.nodes_eliminated += other.nodes_eliminated;
        self.transformed_nodes.extend(other.transformed_nodes);
    }

    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        self.transforms_applied == 0 && self.nodes_eliminated == 0
    }
}

/// A graph-to-graph rewrite
///
/// A pass may edit nodes in place but must leave the graph rebuilt
/// (adjacency consistent with edge names) when it returns.
pub trait GraphTransformer {
    /// Name of the transformer
    fn name(&self) -> &'static str;

    /// Apply the transformation
    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult>;

    /// Check if this transformer is applicable to the graph
    fn is_applicable(&self, _graph: &Graph) -> bool {
        true
    }
}

/// Run multiple transformers in sequence
pub fn run_transformers(
    graph: &mut Graph,
    transformers: &[&dyn GraphTransformer],
) -> ConvertResult<TransformResult> {
    let mut total = TransformResult::new();

    for transformer in transformers {
        if transformer.is_applicable(graph) {
            let result = transformer.transform(graph)?;
            trace!(
                pass = transformer.name(),
                applied = result.transforms_applied,
                eliminated = result.nodes_eliminated,
                "pass finished"
            );
            total.merge(result);
        }
    }

    Ok(total)
}

/// Whether any output of the node is a declared graph output
pub fn writes_graph_output(graph: &Graph, node: &Node) -> bool {
    node.outputs.iter().any(|o| graph.is_graph_output(o))
}

// ============================================================================
// Chain fusion
// ============================================================================

/// Rewrites a single-entry single-exit chain of `num_nodes()` nodes
///
/// The chain is found by walking up from each node while every link has
/// exactly one parent on one side and exactly one child on the other.
pub trait NodesFuser {
    /// Chain length
    fn num_nodes(&self) -> usize;

    /// Whether this chain (in producer-to-consumer order) can be merged
    fn is_eligible(&self, graph: &Graph, chain: &[NodeId]) -> bool;

    /// Rewrite the chain and return the nodes that replace it, in order
    ///
    /// The returned ids may reuse chain nodes or point at nodes appended
    /// with [`Graph::add_node`]. Chain nodes that are not returned are
    /// dropped. Adjacency is fixed up by the driver.
    fn merge(&self, graph: &mut Graph, chain: &[NodeId]) -> ConvertResult<Vec<NodeId>>;
}

/// Drive a [`NodesFuser`] over every chain in the graph
///
/// Each merged group is emitted at the position of the first node that
/// maps to it, so the node order stays topological.
pub fn fuse_chains<F: NodesFuser + ?Sized>(
    fuser: &F,
    graph: &mut Graph,
) -> ConvertResult<TransformResult> {
    let mut result = TransformResult::new();
    let original_len = graph.len();
    let num_nodes = fuser.num_nodes();

    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    let mut group_of: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut dropped: FxHashSet<NodeId> = FxHashSet::default();

    for start in 0..original_len {
        let start = NodeId(start);
        if dropped.contains(&start) {
            continue;
        }
        let Some(chain) = find_chain(graph, start, num_nodes) else {
            continue;
        };
        if !fuser.is_eligible(graph, &chain) {
            continue;
        }
        result.patterns_matched += 1;

        let head = chain[0];
        let tail = chain[chain.len() - 1];
        let ext_parents = graph.node(head).parents.clone();
        let ext_children = graph.node(tail).children.clone();

        let merged = fuser.merge(graph, &chain)?;
        relink(graph, &ext_parents, &ext_children, head, tail, &merged);

        for id in &chain {
            if !merged.contains(id) {
                dropped.insert(*id);
                result.record_elimination(&graph.node(*id).name);
            }
        }
        for id in &merged {
            dropped.remove(id);
        }
        result.record(&graph.node(tail).name);

        let group = groups.len();
        for id in chain.iter().chain(merged.iter()) {
            group_of.insert(*id, group);
        }
        groups.push(merged);
    }

    if groups.is_empty() {
        return Ok(result);
    }

    let mut emitted: FxHashSet<NodeId> = FxHashSet::default();
    let mut order = Vec::with_capacity(graph.len());
    for id in (0..original_len).map(NodeId) {
        let candidates: &[NodeId] = match group_of.get(&id) {
            Some(&group) => &groups[group],
            None => std::slice::from_ref(&id),
        };
        for &candidate in candidates {
            if !dropped.contains(&candidate) && emitted.insert(candidate) {
                order.push(candidate);
            }
        }
    }
    graph.reorder_nodes(&order)?;
    Ok(result)
}

fn find_chain(graph: &Graph, start: NodeId, num_nodes: usize) -> Option<Vec<NodeId>> {
    let mut chain = Vec::with_capacity(num_nodes);
    let mut current = start;
    for _ in 1..num_nodes {
        let Some(parent) = graph.node(current).only_parent() else {
            break;
        };
        if graph.node(parent).children.len() != 1 {
            break;
        }
        chain.insert(0, current);
        current = parent;
    }
    if let Some(&first) = chain.first() {
        if let Some(parent) = graph.node(first).only_parent() {
            if graph.node(parent).children.len() == 1 {
                chain.insert(0, parent);
            }
        }
    }
    (chain.len() == num_nodes).then_some(chain)
}

fn relink(
    graph: &mut Graph,
    ext_parents: &NodeIds,
    ext_children: &NodeIds,
    head: NodeId,
    tail: NodeId,
    merged: &[NodeId],
) {
    let (Some(&first), Some(&last)) = (merged.first(), merged.last()) else {
        return;
    };
    for &p in ext_parents {
        replace_link(&mut graph.node_mut(p).children, head, first);
    }
    for &c in ext_children {
        replace_link(&mut graph.node_mut(c).parents, tail, last);
    }
    for &id in merged {
        let node: &mut Node = graph.node_mut(id);
        node.parents.clear();
        node.children.clear();
    }
    graph.node_mut(first).parents = ext_parents.clone();
    graph.node_mut(last).children = ext_children.clone();
    for pair in merged.windows(2) {
        graph.node_mut(pair[0]).add_child(pair[1]);
        graph.node_mut(pair[1]).add_parent(pair[0]);
    }
}

fn replace_link(links: &mut NodeIds, old: NodeId, new: NodeId) {
    links.retain(|id| *id != old);
    if !links.contains(&new) {
        links.push(new);
    }
}
