//! Expose LSTM hidden and cell state as model I/O
//!
//! The legacy target models recurrent state as extra inputs and outputs of
//! shape `(hidden_size,)`. Missing state edges get derived names.

#![allow(missing_docs)]

use crate::error::{ConvertError, ConvertResult};
use crate::graph::{EdgeInfo, Graph, Node};

use super::common::{GraphTransformer, TransformResult};

const FLOAT: i32 = 1;

/// Initial (h, c) and final (h, Y_c) edge names of an LSTM node
pub fn lstm_state_edges(node: &Node) -> ([String; 2], [String; 2]) {
    let input = node.first_input();
    let output = node.first_output();
    let pick = |edge: Option<&str>, fallback: String| edge.map(str::to_string).unwrap_or(fallback);

    let input_h = pick(node.input(5), format!("{}_h_input", input));
    let input_c = pick(node.input(6), format!("{}_c_input", input));
    let output_h = pick(
        node.outputs.get(1).map(String::as_str).filter(|s| !s.is_empty()),
        format!("{}_h_output", output),
    );
    let output_c = pick(
        node.outputs.get(2).map(String::as_str).filter(|s| !s.is_empty()),
        format!("{}_c_output", output),
    );
    ([input_h, input_c], [output_h, output_c])
}

/// Add LSTM state edges to the declared graph inputs and outputs
#[derive(Debug, Default)]
pub struct ExposeRecurrentState;

impl ExposeRecurrentState {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for ExposeRecurrentState {
    fn name(&self) -> &'static str {
        "ExposeRecurrentState"
    }

    fn is_applicable(&self, graph: &Graph) -> bool {
        graph.nodes().iter().any(|n| n.op_type == "LSTM")
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let lstms: Vec<Node> = graph
            .nodes()
            .iter()
            .filter(|n| n.op_type == "LSTM")
            .cloned()
            .collect();

        for node in &lstms {
            let hidden = node.attrs.int("hidden_size").ok_or_else(|| {
                ConvertError::config("LSTM", &node.name, "hidden_size attribute is required")
            })?;
            let (inputs, outputs) = lstm_state_edges(node);

            for name in inputs {
                if !graph.inputs.iter().any(|i| i.name == name) {
                    graph.inputs.push(EdgeInfo::new(name.clone(), FLOAT, vec![hidden]));
                    result.record(&node.name);
                }
                graph
                    .blob_to_op_type
                    .entry(name)
                    .or_insert_with(|| vec!["LSTM".to_string()]);
            }
            for name in outputs {
                if !graph.outputs.iter().any(|o| o.name == name) {
                    graph.outputs.push(EdgeInfo::new(name.clone(), FLOAT, vec![hidden]));
                    result.record(&node.name);
                }
                graph.blob_from_op_type.insert(name, "LSTM".to_string());
            }
        }

        result.patterns_matched = lstms.len();
        graph.rebuild()?;
        Ok(result)
    }
}
