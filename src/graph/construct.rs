//! Graph construction from decoded ONNX
//!
//! Initializers are hoisted into each consuming node's `input_tensors` and
//! dropped from the declared input list; `shape_dict` is seeded from the
//! shapes the source model already carries.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{ConvertError, ConvertResult};
use crate::proto::{GraphProto, ModelProto, ValueInfoProto};
use crate::tensor::{shape_of, tensor_from_proto, Tensor};

use super::attrs::Attributes;
use super::ir::{EdgeInfo, Graph};
use super::maps::ShapeDict;
use super::node::Node;

impl Graph {
    /// Build the IR from a decoded model
    pub fn from_model(model: &ModelProto) -> ConvertResult<Self> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| ConvertError::Structural("Model has no graph".to_string()))?;
        Self::from_onnx(graph)
    }

    /// Build the IR from a decoded graph
    pub fn from_onnx(proto: &GraphProto) -> ConvertResult<Self> {
        let mut initializers: FxHashMap<String, Tensor> = FxHashMap::default();
        for init in &proto.initializer {
            initializers.insert(init.name.clone(), tensor_from_proto(init)?);
        }

        let mut shape_dict = ShapeDict::default();
        for (name, tensor) in &initializers {
            shape_dict.insert(name.clone(), shape_of(tensor));
        }
        for vi in proto
            .value_info
            .iter()
            .chain(proto.input.iter())
            .chain(proto.output.iter())
        {
            if let Some(shape) = vi.get_shape() {
                shape_dict.insert(vi.name.clone(), shape);
            }
        }

        let mut seen_names: FxHashSet<String> = FxHashSet::default();
        let mut nodes = Vec::with_capacity(proto.node.len());
        for (i, np) in proto.node.iter().enumerate() {
            let mut name = if !np.name.is_empty() {
                np.name.clone()
            } else if let Some(out) = np.output.iter().find(|o| !o.is_empty()) {
                out.clone()
            } else {
                format!("node_{}", i)
            };
            if seen_names.contains(&name) {
                name = format!("{}_{}", name, i);
            }
            seen_names.insert(name.clone());

            let mut node = Node {
                name,
                op_type: np.op_type.clone(),
                attrs: Attributes::from_protos(&np.attribute)?,
                inputs: np.input.clone(),
                outputs: np.output.clone(),
                ..Default::default()
            };
            for input in &np.input {
                if let Some(tensor) = initializers.get(input) {
                    node.input_tensors.insert(input.clone(), tensor.clone());
                }
            }
            nodes.push(node);
        }

        let inputs: Vec<EdgeInfo> = proto
            .input
            .iter()
            .filter(|vi| !initializers.contains_key(&vi.name))
            .map(edge_info)
            .collect();
        let outputs: Vec<EdgeInfo> = proto.output.iter().map(edge_info).collect();

        debug!(
            nodes = nodes.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            initializers = initializers.len(),
            "graph decoded"
        );

        Graph::new(nodes, inputs, outputs, shape_dict)
    }
}

fn edge_info(vi: &ValueInfoProto) -> EdgeInfo {
    EdgeInfo::new(
        vi.name.clone(),
        vi.get_elem_type().unwrap_or(0),
        vi.get_shape().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::extensions::{make_node, make_tensor_f32, make_tensor_value_info};

    fn conv_graph() -> GraphProto {
        GraphProto {
            node: vec![
                make_node("Conv", &["X", "W"], &["conv_out"], "conv_0"),
                make_node("Relu", &["conv_out"], &["Y"], ""),
            ],
            input: vec![
                make_tensor_value_info("X", 1, &[1, 2, 4, 4]),
                make_tensor_value_info("W", 1, &[3, 2, 1, 1]),
            ],
            output: vec![make_tensor_value_info("Y", 1, &[1, 3, -1, -1])],
            initializer: vec![make_tensor_f32("W", &[3, 2, 1, 1], vec![1.0; 6])],
            ..Default::default()
        }
    }

    #[test]
    fn test_initializers_hoisted() {
        let graph = Graph::from_onnx(&conv_graph()).unwrap();

        assert_eq!(graph.inputs.len(), 1);
        assert_eq!(graph.inputs[0].name, "X");
        let conv = graph.node(graph.find_node("conv_0").unwrap());
        assert!(conv.is_const_input(1));
        assert!(conv.parents.is_empty());
    }

    #[test]
    fn test_unnamed_node_takes_output_name() {
        let graph = Graph::from_onnx(&conv_graph()).unwrap();
        assert!(graph.find_node("Y").is_some());
    }

    #[test]
    fn test_shape_dict_keeps_partial_shapes() {
        let graph = Graph::from_onnx(&conv_graph()).unwrap();
        assert_eq!(graph.shape("X"), Some(&[1, 2, 4, 4][..]));
        assert_eq!(graph.shape("W"), Some(&[3, 2, 1, 1][..]));
        assert_eq!(graph.shape("Y"), Some(&[1, 3, -1, -1][..]));
        assert_eq!(graph.rank("Y"), Some(4));
        assert!(graph.shape("conv_out").is_none());
    }

    #[test]
    fn test_symbolic_batch_keeps_rank() {
        let mut proto = conv_graph();
        proto.input[0] = make_tensor_value_info("X", 1, &[-1, 2, 4, 4]);
        let graph = Graph::from_onnx(&proto).unwrap();
        assert_eq!(graph.shape("X"), Some(&[-1, 2, 4, 4][..]));
        assert_eq!(graph.rank("X"), Some(4));
    }

    #[test]
    fn test_duplicate_producer_in_source() {
        let mut proto = conv_graph();
        proto
            .node
            .push(make_node("Relu", &["X"], &["conv_out"], "relu_dup"));
        assert!(matches!(
            Graph::from_onnx(&proto),
            Err(ConvertError::Structural(_))
        ));
    }
}
