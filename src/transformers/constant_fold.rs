//! Constant folding transformers
//!
//! Passes that evaluate nodes whose inputs are all known at compile time
//! and hand the result to the consumers as `input_tensors`.
//!
//! - [`ConstantsToInitializers`]: `Constant` nodes
//! - [`FoldShape`]: `Shape` of a fully known edge
//! - [`ConstantFold`]: parentless all-constant arithmetic and layout ops
//! - [`FuseReshapeInitTensor`]: `Reshape` of a constant
//! - [`ConstantFillToInitializers`]: `ConstantFill` with a constant shape

#![allow(missing_docs)]

use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::{ConvertError, ConvertResult};
use crate::graph::{AttrValue, Graph, Node, NodeId};
use crate::tensor::{ops, scalar, shape_of, tensor_from_vec, tensor_to_i64, Tensor};

use super::common::{writes_graph_output, GraphTransformer, TransformResult};

/// Hand `value` to every consumer of the node's first output and drop the node
fn replace_with_constant(
    graph: &mut Graph,
    id: NodeId,
    value: &Tensor,
    removed: &mut FxHashSet<NodeId>,
    result: &mut TransformResult,
) {
    let node = graph.node(id);
    let edge = node.first_output().to_string();
    result.record_elimination(&node.name);
    graph.feed_constant(id, &edge, value);
    graph.record_shape(&edge, shape_of(value));
    removed.insert(id);
}

fn finish(
    graph: &mut Graph,
    removed: FxHashSet<NodeId>,
    mut result: TransformResult,
) -> ConvertResult<TransformResult> {
    result.patterns_matched = removed.len();
    graph.remove_nodes(&removed)?;
    Ok(result)
}

fn vector(values: &[i64]) -> ConvertResult<Tensor> {
    tensor_from_vec(&[values.len()], values.iter().map(|&v| v as f32).collect())
}

/// Integer list from an attribute, or else from constant input `i`
fn ints_attr_or_input(node: &Node, key: &str, i: usize) -> Option<Vec<i64>> {
    node.attrs
        .ints(key)
        .or_else(|| node.input_tensor(i).map(tensor_to_i64))
}

// ============================================================================
// Constant nodes
// ============================================================================

/// Value carried by a `Constant` node's attributes
fn constant_value(node: &Node) -> ConvertResult<Option<Tensor>> {
    if let Some(value) = node.attrs.tensor("value") {
        return Ok(Some(value.clone()));
    }
    if let Some(v) = node.attrs.float("value_float") {
        return Ok(Some(scalar(v)));
    }
    if let Some(v) = node.attrs.int("value_int") {
        return Ok(Some(scalar(v as f32)));
    }
    if let Some(v) = node.attrs.floats("value_floats") {
        return tensor_from_vec(&[v.len()], v).map(Some);
    }
    if let Some(v) = node.attrs.ints("value_ints") {
        return vector(&v).map(Some);
    }
    Ok(None)
}

/// Turn `Constant` nodes into consumer `input_tensors`
///
/// Constants that are themselves graph outputs stay, so the output keeps a
/// producer.
#[derive(Debug, Default)]
pub struct ConstantsToInitializers;

impl ConstantsToInitializers {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for ConstantsToInitializers {
    fn name(&self) -> &'static str {
        "ConstantsToInitializers"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut removed = FxHashSet::default();

        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id);
            if node.op_type != "Constant" || writes_graph_output(graph, node) {
                continue;
            }
            let Some(value) = constant_value(node)? else {
                continue;
            };
            replace_with_constant(graph, id, &value, &mut removed, &mut result);
        }
        finish(graph, removed, result)
    }
}

/// Turn `ConstantFill(input_as_shape=1)` with a constant shape into a tensor
///
/// value = ones(shape) * `value` (default 0.0). Nodes with `extra_shape`
/// are left alone.
#[derive(Debug, Default)]
pub struct ConstantFillToInitializers;

impl ConstantFillToInitializers {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for ConstantFillToInitializers {
    fn name(&self) -> &'static str {
        "ConstantFillToInitializers"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut removed = FxHashSet::default();

        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id);
            if node.op_type != "ConstantFill"
                || node.attrs.int("input_as_shape") != Some(1)
                || node.attrs.contains("extra_shape")
                || writes_graph_output(graph, node)
            {
                continue;
            }
            let Some(shape) = node.input_tensor(0).map(tensor_to_i64) else {
                continue;
            };
            if shape.iter().any(|&d| d < 0) {
                continue;
            }
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let fill = node.attrs.float_or("value", 0.0);
            let value = ArrayD::from_elem(IxDyn(&dims), fill);
            replace_with_constant(graph, id, &value, &mut removed, &mut result);
        }
        finish(graph, removed, result)
    }
}

// ============================================================================
// Shape
// ============================================================================

/// Fold `Shape` of an edge whose dims are all known and positive
#[derive(Debug, Default)]
pub struct FoldShape;

impl FoldShape {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for FoldShape {
    fn name(&self) -> &'static str {
        "FoldShape"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut removed = FxHashSet::default();

        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id);
            if node.op_type != "Shape" || writes_graph_output(graph, node) {
                continue;
            }
            let Some(dims) = graph.shape(node.first_input()) else {
                continue;
            };
            if dims.iter().any(|&d| d <= 0) {
                continue;
            }
            let value = vector(dims)?;
            replace_with_constant(graph, id, &value, &mut removed, &mut result);
        }
        finish(graph, removed, result)
    }
}

// ============================================================================
// General folding
// ============================================================================

/// Evaluate a supported op on constant inputs
///
/// Returns `None` for op types this pass does not evaluate.
pub fn evaluate(node: &Node) -> ConvertResult<Option<Tensor>> {
    let arg = |i: usize| {
        node.input_tensor(i).ok_or_else(|| {
            ConvertError::Structural(format!(
                "{} ({}): input {} is not constant",
                node.name, node.op_type, i
            ))
        })
    };
    let attrs = &node.attrs;

    let value = match node.op_type.as_str() {
        "Gather" => ops::take(arg(0)?, arg(1)?, attrs.int_or("axis", 0))?,
        "Floor" => ops::floor(arg(0)?),
        "Div" => ops::div(arg(0)?, arg(1)?)?,
        "Mul" => ops::mul(arg(0)?, arg(1)?)?,
        "Slice" => {
            let (Some(starts), Some(ends)) = (
                ints_attr_or_input(node, "starts", 1),
                ints_attr_or_input(node, "ends", 2),
            ) else {
                return Err(ConvertError::Structural(format!(
                    "{}: Slice without starts/ends",
                    node.name
                )));
            };
            let axes = ints_attr_or_input(node, "axes", 3);
            let steps = node.input_tensor(4).map(tensor_to_i64);
            ops::slice(arg(0)?, &starts, &ends, axes.as_deref(), steps.as_deref())?
        }
        "Transpose" => ops::transpose(arg(0)?, &attrs.ints("perm").unwrap_or_default())?,
        "Concat" => {
            let parts: Vec<&Tensor> = (0..node.inputs.len())
                .map(arg)
                .collect::<ConvertResult<_>>()?;
            ops::concat(&parts, attrs.int_or("axis", 0))?
        }
        "Unsqueeze" => {
            let axes = ints_attr_or_input(node, "axes", 1).unwrap_or_default();
            ops::unsqueeze(arg(0)?, &axes)?
        }
        "Squeeze" => {
            let axes = ints_attr_or_input(node, "axes", 1).unwrap_or_default();
            ops::squeeze(arg(0)?, &axes)?
        }
        "Gemm" => ops::gemm(
            arg(0)?,
            arg(1)?,
            node.input_tensor(2),
            attrs.float_or("alpha", 1.0),
            attrs.float_or("beta", 1.0),
            attrs.int_or("transA", 0) != 0,
            attrs.int_or("transB", 0) != 0,
        )?,
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Fold parentless nodes whose inputs are all constant
///
/// Covers Gather, Floor, Div, Mul, Slice, Transpose, Concat, Unsqueeze,
/// Squeeze and Gemm.
#[derive(Debug, Default)]
pub struct ConstantFold;

impl ConstantFold {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for ConstantFold {
    fn name(&self) -> &'static str {
        "ConstantFold"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut removed = FxHashSet::default();

        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id);
            let mut inputs = node.inputs.iter().filter(|i| !i.is_empty()).peekable();
            if !node.parents.is_empty()
                || inputs.peek().is_none()
                || writes_graph_output(graph, node)
            {
                continue;
            }
            if !inputs.all(|i| node.input_tensors.contains_key(i)) {
                continue;
            }
            let Some(value) = evaluate(node)? else {
                continue;
            };
            debug!(node = %node.name, op = %node.op_type, shape = ?value.shape(), "folded");
            replace_with_constant(graph, id, &value, &mut removed, &mut result);
        }
        finish(graph, removed, result)
    }
}

/// Fold `Reshape` of a constant tensor by a constant shape
///
/// The shape comes from the `shape` attribute (old opsets) or the second
/// input. A `0` dim in the target is left for the lowering to handle.
#[derive(Debug, Default)]
pub struct FuseReshapeInitTensor;

impl FuseReshapeInitTensor {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransformer for FuseReshapeInitTensor {
    fn name(&self) -> &'static str {
        "FuseReshapeInitTensor"
    }

    fn transform(&self, graph: &mut Graph) -> ConvertResult<TransformResult> {
        let mut result = TransformResult::new();
        let mut removed = FxHashSet::default();

        for id in graph.node_ids().collect::<Vec<_>>() {
            let node = graph.node(id);
            if node.op_type != "Reshape"
                || !(1..=2).contains(&node.inputs.len())
                || writes_graph_output(graph, node)
            {
                continue;
            }
            if node
                .parents
                .iter()
                .any(|p| graph.node(*p).op_type != "Constant")
            {
                continue;
            }
            let Some(data) = node.input_tensor(0) else {
                continue;
            };
            let shape = match node.attrs.ints("shape") {
                Some(shape) => shape,
                None if node.inputs.len() == 2 => match node.input_tensor(1) {
                    Some(shape) => tensor_to_i64(shape),
                    None => continue,
                },
                None => continue,
            };
            if shape.contains(&0) {
                continue;
            }
            let value = ops::reshape(data, &shape)?;
            replace_with_constant(graph, id, &value, &mut removed, &mut result);
        }
        finish(graph, removed, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeInfo, ShapeDict};

    fn graph(nodes: Vec<Node>, shape_dict: ShapeDict) -> Graph {
        Graph::new(
            nodes,
            vec![EdgeInfo::new("x", 1, vec![1, 3, 4, 4])],
            vec![EdgeInfo::new("y", 1, vec![])],
            shape_dict,
        )
        .unwrap()
    }

    fn t(shape: &[usize], data: Vec<f32>) -> Tensor {
        tensor_from_vec(shape, data).unwrap()
    }

    #[test]
    fn test_constant_node_moves_into_consumer() {
        let mut g = graph(
            vec![
                Node::new("c", "Constant", &[] as &[&str], &["c_out"])
                    .with_attr("value", AttrValue::Tensor(t(&[2], vec![1.0, 2.0]))),
                Node::new("add", "Add", &["x", "c_out"], &["y"]),
            ],
            ShapeDict::default(),
        );
        let result = ConstantsToInitializers::new().transform(&mut g).unwrap();

        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(g.node_names(), vec!["add"]);
        assert!(g.node(NodeId(0)).is_const_input(1));
        assert_eq!(g.shape("c_out"), Some(&[2][..]));
    }

    #[test]
    fn test_constant_graph_output_kept() {
        let mut g = graph(
            vec![Node::new("c", "Constant", &[] as &[&str], &["y"])
                .with_attr("value_float", AttrValue::Float(1.0))],
            ShapeDict::default(),
        );
        let result = ConstantsToInitializers::new().transform(&mut g).unwrap();
        assert!(result.is_empty());
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_fold_shape() {
        let mut shapes = ShapeDict::default();
        shapes.insert("x".to_string(), vec![1, 3, 4, 4]);
        let mut g = graph(
            vec![
                Node::new("shape", "Shape", &["x"], &["s"]),
                Node::new("reshape", "Reshape", &["x", "s"], &["y"]),
            ],
            shapes,
        );
        FoldShape::new().transform(&mut g).unwrap();

        let reshape = g.node(NodeId(0));
        assert_eq!(reshape.name, "reshape");
        assert_eq!(tensor_to_i64(reshape.input_tensor(1).unwrap()), vec![1, 3, 4, 4]);
    }

    #[test]
    fn test_fold_gather_of_constant() {
        let mut g = graph(
            vec![
                Node::new("gather", "Gather", &["data", "idx"], &["g"])
                    .with_tensor("data", t(&[4], vec![1.0, 3.0, 4.0, 4.0]))
                    .with_tensor("idx", t(&[1], vec![1.0])),
                Node::new("reshape", "Reshape", &["x", "g"], &["y"]),
            ],
            ShapeDict::default(),
        );
        let result = ConstantFold::new().transform(&mut g).unwrap();

        assert_eq!(result.nodes_eliminated, 1);
        let reshape = g.node(NodeId(0));
        assert_eq!(tensor_to_i64(reshape.input_tensor(1).unwrap()), vec![3]);
        assert_eq!(g.shape("g"), Some(&[1][..]));
    }

    #[test]
    fn test_fold_chain_over_rounds() {
        // Unsqueeze feeds Concat; the second only folds once the first is gone
        let mut g = graph(
            vec![
                Node::new("u", "Unsqueeze", &["a"], &["u_out"])
                    .with_tensor("a", scalar(2.0))
                    .with_attr("axes", AttrValue::Ints(vec![0])),
                Node::new("cat", "Concat", &["u_out", "b"], &["shape"])
                    .with_tensor("b", t(&[1], vec![8.0]))
                    .with_attr("axis", AttrValue::Int(0)),
                Node::new("reshape", "Reshape", &["x", "shape"], &["y"]),
            ],
            ShapeDict::default(),
        );
        ConstantFold::new().transform(&mut g).unwrap();
        ConstantFold::new().transform(&mut g).unwrap();

        assert_eq!(g.node_names(), vec!["reshape"]);
        let reshape = g.node(NodeId(0));
        assert_eq!(tensor_to_i64(reshape.input_tensor(1).unwrap()), vec![2, 8]);
    }

    /// Fold `node` (writing `c`) into `add(x, c)` and return the folded value
    fn fold_into_add(node: Node) -> Tensor {
        let mut g = graph(
            vec![node, Node::new("add", "Add", &["x", "c"], &["y"])],
            ShapeDict::default(),
        );
        let result = ConstantFold::new().transform(&mut g).unwrap();
        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(g.node_names(), vec!["add"]);
        g.node(NodeId(0)).input_tensor(1).unwrap().clone()
    }

    #[test]
    fn test_fold_reversing_slice() {
        let node = Node::new("s", "Slice", &["d", "st", "en", "ax", "sp"], &["c"])
            .with_tensor("d", t(&[4], vec![1.0, 2.0, 3.0, 4.0]))
            .with_tensor("st", t(&[1], vec![3.0]))
            .with_tensor("en", t(&[1], vec![-5.0]))
            .with_tensor("ax", t(&[1], vec![0.0]))
            .with_tensor("sp", t(&[1], vec![-1.0]));
        assert_eq!(tensor_to_i64(&fold_into_add(node)), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_fold_strided_slice() {
        let node = Node::new("s", "Slice", &["d", "st", "en", "ax", "sp"], &["c"])
            .with_tensor("d", t(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]))
            .with_tensor("st", t(&[1], vec![0.0]))
            .with_tensor("en", t(&[1], vec![3.0]))
            .with_tensor("ax", t(&[1], vec![1.0]))
            .with_tensor("sp", t(&[1], vec![2.0]));
        let out = fold_into_add(node);
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(tensor_to_i64(&out), vec![0, 2, 3, 5]);
    }

    #[test]
    fn test_fold_div_and_mul_broadcast() {
        let div = Node::new("div", "Div", &["a", "b"], &["c"])
            .with_tensor("a", t(&[2], vec![6.0, 9.0]))
            .with_tensor("b", scalar(3.0));
        assert_eq!(tensor_to_i64(&fold_into_add(div)), vec![2, 3]);

        let mul = Node::new("mul", "Mul", &["a", "b"], &["c"])
            .with_tensor("a", t(&[2, 1], vec![1.0, 2.0]))
            .with_tensor("b", t(&[2], vec![10.0, 100.0]));
        let out = fold_into_add(mul);
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(tensor_to_i64(&out), vec![10, 100, 20, 200]);
    }

    #[test]
    fn test_fold_floor() {
        let node = Node::new("f", "Floor", &["a"], &["c"])
            .with_tensor("a", t(&[3], vec![1.5, -0.5, 2.0]));
        assert_eq!(fold_into_add(node).iter().copied().collect::<Vec<_>>(), vec![1.0, -1.0, 2.0]);
    }

    #[test]
    fn test_fold_transpose() {
        let node = Node::new("tr", "Transpose", &["a"], &["c"])
            .with_tensor("a", t(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]))
            .with_attr("perm", AttrValue::Ints(vec![1, 0]));
        let out = fold_into_add(node);
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(tensor_to_i64(&out), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_fold_gemm() {
        // [[1, 2]] x [[1, 0], [0, 1]]^T * 2 + 0.5 * [1, 1]
        let node = Node::new("g", "Gemm", &["a", "b", "bias"], &["c"])
            .with_tensor("a", t(&[1, 2], vec![1.0, 2.0]))
            .with_tensor("b", t(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]))
            .with_tensor("bias", t(&[2], vec![1.0, 1.0]))
            .with_attr("alpha", AttrValue::Float(2.0))
            .with_attr("beta", AttrValue::Float(0.5))
            .with_attr("transB", AttrValue::Int(1));
        let out = fold_into_add(node);
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![2.5, 4.5]);
    }

    #[test]
    fn test_unsupported_op_left_alone() {
        let mut g = graph(
            vec![Node::new("sin", "Sin", &["a"], &["y"]).with_tensor("a", scalar(0.0))],
            ShapeDict::default(),
        );
        assert!(ConstantFold::new().transform(&mut g).unwrap().is_empty());
    }

    #[test]
    fn test_reshape_of_constant() {
        let mut g = graph(
            vec![
                Node::new("r", "Reshape", &["w", "s"], &["w2"])
                    .with_tensor("w", t(&[2, 3], vec![0.0; 6]))
                    .with_tensor("s", t(&[2], vec![3.0, -1.0])),
                Node::new("mul", "Mul", &["x", "w2"], &["y"]),
            ],
            ShapeDict::default(),
        );
        FuseReshapeInitTensor::new().transform(&mut g).unwrap();
        assert_eq!(g.node_names(), vec!["mul"]);
        assert_eq!(g.node(NodeId(0)).input_tensor(1).unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_constant_fill() {
        let mut g = graph(
            vec![
                Node::new("fill", "ConstantFill", &["s"], &["f"])
                    .with_tensor("s", t(&[2], vec![2.0, 2.0]))
                    .with_attr("input_as_shape", AttrValue::Int(1))
                    .with_attr("value", AttrValue::Float(0.5)),
                Node::new("add", "Add", &["x", "f"], &["y"]),
            ],
            ShapeDict::default(),
        );
        ConstantFillToInitializers::new().transform(&mut g).unwrap();
        let fill = g.node(NodeId(0)).input_tensor(1).unwrap();
        assert_eq!(fill.shape(), &[2, 2]);
        assert!(fill.iter().all(|&v| v == 0.5));
    }
}
