//! Graph transformers
//!
//! This module provides the rewrite passes that run before lowering:
//!
//! - **Folding**: evaluate constants, `Shape` of known edges, constant `Reshape`
//! - **Elimination**: Dropout, Cast, zero Pad, ImageScaler, dead code
//! - **Fusion**: Conv+Add, BatchNormalization+Mul/Add
//! - **Shape**: rank-6 Reshape/Transpose chains rewritten at rank 4
//!
//! # Overview
//!
//! Each pass implements [`GraphTransformer`]. Fixed-length chain rewrites
//! implement [`NodesFuser`] and are driven by [`fuse_chains`].
//! [`TransformPipeline`] runs an ordered pass list until a round leaves the
//! set of node names unchanged.
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::transformers::{FuseConvAdd, GraphTransformer, TransformPipeline};
//!
//! let result = FuseConvAdd::new().transform(&mut graph)?;
//! println!("Fused {} Conv+Add pairs", result.transforms_applied);
//!
//! let report = TransformPipeline::standard(true).run(&mut graph)?;
//! println!("converged after {} rounds", report.rounds);
//! ```

/// Common utilities and types
pub mod common;
/// Constant folding transformers
pub mod constant_fold;
/// Elimination transformers
pub mod eliminate;
/// Fuse BatchNormalization + broadcast Mul/Add
pub mod fuse_bn_broadcast;
/// Fuse Conv + Add
pub mod fuse_conv_add;
/// Rank-6 Reshape/Transpose rewrites
pub mod optimize_reshape;
/// LSTM state as model I/O
pub mod recurrent_state;

pub use common::{
    fuse_chains, run_transformers, writes_graph_output, GraphTransformer, NodesFuser,
    TransformResult,
};
pub use constant_fold::{
    ConstantFillToInitializers, ConstantFold, ConstantsToInitializers, FoldShape,
    FuseReshapeInitTensor,
};
pub use eliminate::{
    EliminateCast, EliminateDeadCode, EliminateDropout, EliminateImageScaler, EliminateZeroPad,
    RenameOutputs,
};
pub use fuse_bn_broadcast::{FuseBNBroadcastAdd, FuseBNBroadcastMul};
pub use fuse_conv_add::FuseConvAdd;
pub use optimize_reshape::{FusePixelShuffle, FuseReshapeTransposeReshape};
pub use recurrent_state::ExposeRecurrentState;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::error::ConvertResult;
use crate::graph::Graph;

/// Outcome of a pipeline run
#[derive(Debug, Default, Clone)]
pub struct PipelineReport {
    /// Rounds executed, including the final one that changed nothing
    pub rounds: usize,
    /// Whether the node-name set stabilized before the round cap
    pub converged: bool,
    /// Accumulated statistics over all rounds
    pub result: TransformResult,
}

/// Ordered pass list run to a fixpoint
pub struct TransformPipeline {
    passes: Vec<Box<dyn GraphTransformer>>,
    /// Upper bound on rounds
    pub max_rounds: usize,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("passes", &self.pass_names())
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

impl TransformPipeline {
    /// Pipeline over an explicit pass list
    pub fn new(passes: Vec<Box<dyn GraphTransformer>>) -> Self {
        Self {
            passes,
            max_rounds: 32,
        }
    }

    /// The shipped pass list
    ///
    /// `legacy` adds [`ExposeRecurrentState`], which only the rank-5
    /// dialect needs.
    pub fn standard(legacy: bool) -> Self {
        let mut passes: Vec<Box<dyn GraphTransformer>> = vec![
            Box::new(ConstantsToInitializers::new()),
            Box::new(FoldShape::new()),
            Box::new(ConstantFold::new()),
            Box::new(EliminateCast::new()),
            Box::new(EliminateZeroPad::new()),
            Box::new(FuseReshapeInitTensor::new()),
            Box::new(EliminateDropout::new()),
            Box::new(EliminateDeadCode::new()),
            Box::new(FuseConvAdd::new()),
            Box::new(FuseBNBroadcastMul::new()),
            Box::new(FuseBNBroadcastAdd::new()),
            Box::new(FuseReshapeTransposeReshape::new()),
            Box::new(FusePixelShuffle::new()),
        ];
        if legacy {
            passes.push(Box::new(ExposeRecurrentState::new()));
        }
        passes.push(Box::new(ConstantFillToInitializers::new()));
        Self::new(passes)
    }

    /// Override the round cap
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    /// Names of the passes, in order
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass in order until a round leaves the node-name set unchanged
    pub fn run(&self, graph: &mut Graph) -> ConvertResult<PipelineReport> {
        let mut report = PipelineReport::default();
        let passes: Vec<&dyn GraphTransformer> = self.passes.iter().map(|p| p.as_ref()).collect();

        loop {
            let before = node_name_set(graph);
            let round = run_transformers(graph, &passes)?;
            report.rounds += 1;
            debug!(
                round = report.rounds,
                applied = round.transforms_applied,
                eliminated = round.nodes_eliminated,
                nodes = graph.len(),
                "transform round"
            );
            report.result.merge(round);

            if node_name_set(graph) == before {
                report.converged = true;
                break;
            }
            if report.rounds >= self.max_rounds {
                warn!(rounds = report.rounds, "transform pipeline hit its round cap");
                break;
            }
        }
        Ok(report)
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::standard(false)
    }
}

fn node_name_set(graph: &Graph) -> FxHashSet<String> {
    graph.nodes().iter().map(|n| n.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrValue, EdgeInfo, Node, NodeId, ShapeDict};
    use crate::tensor::tensor_from_vec;

    fn conv_add_dropout() -> Graph {
        let w = tensor_from_vec(&[2, 1, 1, 1], vec![1.0, 1.0]).unwrap();
        let c = tensor_from_vec(&[2], vec![0.5, 0.25]).unwrap();
        Graph::new(
            vec![
                Node::new("conv", "Conv", &["x", "w"], &["conv_out"]).with_tensor("w", w),
                Node::new("add", "Add", &["conv_out", "c"], &["add_out"])
                    .with_tensor("c", c)
                    .with_attr("broadcast", AttrValue::Int(1))
                    .with_attr("axis", AttrValue::Int(1)),
                Node::new("drop", "Dropout", &["add_out"], &["drop_out"]),
                Node::new("relu", "Relu", &["drop_out"], &["y"]),
                Node::new("dead", "Relu", &["x"], &["unused"]),
            ],
            vec![EdgeInfo::new("x", 1, vec![1, 1, 4, 4])],
            vec![EdgeInfo::new("y", 1, vec![1, 2, 4, 4])],
            ShapeDict::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_standard_pass_order() {
        let names = TransformPipeline::standard(true).pass_names();
        assert_eq!(names.first(), Some(&"ConstantsToInitializers"));
        assert_eq!(names.last(), Some(&"ConstantFillToInitializers"));
        assert!(names.contains(&"ExposeRecurrentState"));
        assert!(!TransformPipeline::standard(false)
            .pass_names()
            .contains(&"ExposeRecurrentState"));
    }

    #[test]
    fn test_pipeline_reaches_fixpoint() {
        let mut g = conv_add_dropout();
        let report = TransformPipeline::standard(false).run(&mut g).unwrap();

        assert!(report.converged);
        assert!(report.rounds >= 2);
        assert_eq!(g.node_names(), vec!["conv", "relu"]);
        let conv = g.node(NodeId(0));
        assert_eq!(conv.outputs, vec!["drop_out"]);
        let bias: Vec<f32> = conv.input_tensor(2).unwrap().iter().copied().collect();
        assert_eq!(bias, vec![0.5, 0.25]);
        g.verify_adjacency().unwrap();
    }

    #[test]
    fn test_pipeline_idempotent() {
        let mut g = conv_add_dropout();
        TransformPipeline::standard(false).run(&mut g).unwrap();
        let names: Vec<String> = g.node_names().iter().map(|s| s.to_string()).collect();

        let report = TransformPipeline::standard(false).run(&mut g).unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(g.node_names(), names);
    }

    #[test]
    fn test_round_cap() {
        let mut g = conv_add_dropout();
        let report = TransformPipeline::standard(false)
            .with_max_rounds(1)
            .run(&mut g)
            .unwrap();
        assert_eq!(report.rounds, 1);
        assert!(!report.converged);
    }
}
