//! Op lowering
//!
//! Turns each graph node into target layers through a [`SpecBuilder`].
//!
//! - [`DispatchTable`]: op type → lowering function, one table per [`Dialect`]
//! - [`LoweringOverrides`]: user functions keyed by node name or op type
//! - [`ErrorHandler`]: fails or emits a custom layer for unsupported nodes
//! - [`LoweringCx`]: what a lowering function works against
//!
//! # Resolution
//!
//! For every node, in order: an override for the node's name, an override
//! for its op type, the dialect table, and finally the escape hatch.
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::lowering::{lower_graph, Dialect, ErrorHandler, LoweringCx, LoweringOverrides};
//!
//! let mut err = ErrorHandler::new(false, Dialect::Nd);
//! let mut cx = LoweringCx::new(&mut spec, &mut graph, &mut err);
//! lower_graph(&mut cx, &LoweringOverrides::new(), Dialect::Nd)?;
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::axis::rules::TargetPerm;
use crate::axis::{Axis, AxisMapping};
use crate::builder::{Activation, CustomParam, LayerKind, SpecBuilder};
use crate::error::{ConvertError, ConvertResult, CUSTOM_FUNCTION_HINT, RAISE_TARGET_HINT};
use crate::graph::{AttrValue, Attributes, Graph, Node};

/// Reject the node with the rule's reason when a layout rule fails
macro_rules! layout {
    ($cx:expr, $node:expr, $rule:expr) => {
        match $rule {
            Ok(value) => value,
            Err(unmappable) => return $cx.reject($node, unmappable.0),
        }
    };
}

pub mod legacy;
pub mod nd;

/// Built-in lowering function
pub type LoweringFn = fn(&mut LoweringCx<'_>, &Node) -> ConvertResult<()>;

/// User-supplied lowering function
pub type CustomLowering =
    Arc<dyn Fn(&mut LoweringCx<'_>, &Node) -> ConvertResult<()> + Send + Sync>;

/// Which lowering path a compile uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dialect {
    /// Rank-5 `[S, B, C, H, W]` layers driven by the axis map
    Legacy,
    /// Arbitrary-rank layers driven by static ranks
    Nd,
}

impl Dialect {
    /// Hint attached to unsupported-op failures
    pub fn unsupported_hint(self) -> &'static str {
        match self {
            Dialect::Legacy => RAISE_TARGET_HINT,
            Dialect::Nd => CUSTOM_FUNCTION_HINT,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Immutable op type → lowering function table
pub struct DispatchTable {
    dialect: Dialect,
    entries: FxHashMap<&'static str, LoweringFn>,
}

static LEGACY_TABLE: OnceLock<DispatchTable> = OnceLock::new();
static ND_TABLE: OnceLock<DispatchTable> = OnceLock::new();

impl DispatchTable {
    fn from_entries(dialect: Dialect, entries: &[(&'static str, LoweringFn)]) -> Self {
        Self {
            dialect,
            entries: entries.iter().copied().collect(),
        }
    }

    /// Table of the rank-5 dialect
    pub fn legacy() -> &'static DispatchTable {
        LEGACY_TABLE.get_or_init(|| Self::from_entries(Dialect::Legacy, legacy::ENTRIES))
    }

    /// Table of the arbitrary-rank dialect
    pub fn nd() -> &'static DispatchTable {
        ND_TABLE.get_or_init(|| Self::from_entries(Dialect::Nd, nd::ENTRIES))
    }

    /// Table for a dialect
    pub fn for_dialect(dialect: Dialect) -> &'static DispatchTable {
        match dialect {
            Dialect::Legacy => Self::legacy(),
            Dialect::Nd => Self::nd(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Lowering function for an op type
    pub fn get(&self, op_type: &str) -> Option<LoweringFn> {
        self.entries.get(op_type).copied()
    }

    /// Whether the op type has an entry
    pub fn supports(&self, op_type: &str) -> bool {
        self.entries.contains_key(op_type)
    }

    /// Supported op types, sorted
    pub fn op_types(&self) -> Vec<&'static str> {
        let mut ops: Vec<_> = self.entries.keys().copied().collect();
        ops.sort_unstable();
        ops
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("dialect", &self.dialect)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// User lowering functions keyed by node name and by op type
#[derive(Clone, Default)]
pub struct LoweringOverrides {
    by_node: FxHashMap<String, CustomLowering>,
    by_op: FxHashMap<String, CustomLowering>,
}

impl LoweringOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the lowering of one node
    pub fn insert_node(&mut self, node_name: impl Into<String>, f: CustomLowering) {
        self.by_node.insert(node_name.into(), f);
    }

    /// Override the lowering of every node of an op type
    pub fn insert_op(&mut self, op_type: impl Into<String>, f: CustomLowering) {
        self.by_op.insert(op_type.into(), f);
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty() && self.by_op.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_node.len() + self.by_op.len()
    }
}

impl fmt::Debug for LoweringOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoweringOverrides")
            .field("by_node", &self.by_node.keys().collect::<Vec<_>>())
            .field("by_op", &self.by_op.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lowering chosen for one node
pub enum Resolved<'a> {
    /// Override keyed by the node's name
    NodeOverride(&'a CustomLowering),
    /// Override keyed by the node's op type
    OpOverride(&'a CustomLowering),
    /// Dialect table entry
    Table(LoweringFn),
    /// Nothing matched
    EscapeHatch,
}

impl fmt::Debug for Resolved<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolved::NodeOverride(_) => "NodeOverride",
            Resolved::OpOverride(_) => "OpOverride",
            Resolved::Table(_) => "Table",
            Resolved::EscapeHatch => "EscapeHatch",
        };
        f.write_str(name)
    }
}

/// Pick the lowering for a node
pub fn resolve<'a>(
    node: &Node,
    overrides: &'a LoweringOverrides,
    table: &DispatchTable,
) -> Resolved<'a> {
    if let Some(f) = overrides.by_node.get(&node.name) {
        Resolved::NodeOverride(f)
    } else if let Some(f) = overrides.by_op.get(&node.op_type) {
        Resolved::OpOverride(f)
    } else if let Some(f) = table.get(&node.op_type) {
        Resolved::Table(f)
    } else {
        Resolved::EscapeHatch
    }
}

/// Fail before emitting anything if some op type has no table entry
///
/// Overrides count as support. All offending op types are listed once, in
/// order of first appearance.
pub fn check_unsupported_ops(
    nodes: &[Node],
    overrides: &LoweringOverrides,
    dialect: Dialect,
) -> ConvertResult<()> {
    let table = DispatchTable::for_dialect(dialect);
    let mut missing: Vec<&str> = Vec::new();
    for node in nodes {
        let covered = table.supports(&node.op_type)
            || overrides.by_op.contains_key(&node.op_type)
            || overrides.by_node.contains_key(&node.name);
        if !covered && !missing.contains(&node.op_type.as_str()) {
            missing.push(&node.op_type);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(ConvertError::UnsupportedOp {
        op_types: missing.join(","),
        node: None,
        hint: dialect.unsupported_hint().to_string(),
    })
}

/// Lower one node through the resolution chain
pub fn lower_node(
    cx: &mut LoweringCx<'_>,
    node: &Node,
    overrides: &LoweringOverrides,
    table: &DispatchTable,
) -> ConvertResult<()> {
    match resolve(node, overrides, table) {
        Resolved::NodeOverride(f) | Resolved::OpOverride(f) => f(cx, node),
        Resolved::Table(f) => f(cx, node),
        Resolved::EscapeHatch => cx.unsupported_op(node),
    }
}

/// Lower every node of the graph in order
pub fn lower_graph(
    cx: &mut LoweringCx<'_>,
    overrides: &LoweringOverrides,
    dialect: Dialect,
) -> ConvertResult<()> {
    let table = DispatchTable::for_dialect(dialect);
    let total = cx.graph.len();
    for index in 0..total {
        let node = cx.graph.nodes()[index].clone();
        debug!(
            index = index + 1,
            total,
            op_type = %node.op_type,
            node = %node.name,
            "lowering node"
        );
        if dialect == Dialect::Legacy && !legacy::load_constant_inputs(cx, &node)? {
            continue;
        }
        lower_node(cx, &node, overrides, table)?;
    }
    Ok(())
}

// ============================================================================
// Escape hatch
// ============================================================================

/// A node lowered to a custom layer, with the shapes known at that point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomLayerNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<(String, Option<Vec<i64>>)>,
    pub outputs: Vec<(String, Option<Vec<i64>>)>,
}

impl CustomLayerNode {
    fn capture(node: &Node, graph: &Graph) -> Self {
        let with_shape = |edges: &[String]| {
            edges
                .iter()
                .map(|e| (e.clone(), graph.shape(e).map(<[i64]>::to_vec)))
                .collect()
        };
        Self {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            inputs: with_shape(&node.inputs),
            outputs: with_shape(&node.outputs),
        }
    }
}

impl fmt::Display for CustomLayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn edges(f: &mut fmt::Formatter<'_>, list: &[(String, Option<Vec<i64>>)]) -> fmt::Result {
            for (i, (name, shape)) in list.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                match shape {
                    Some(s) => write!(f, "{} {:?}", name, s)?,
                    None => write!(f, "{} (shape not available)", name)?,
                }
            }
            Ok(())
        }
        write!(f, "op type: {}, inputs: [", self.op_type)?;
        edges(f, &self.inputs)?;
        f.write_str("], outputs: [")?;
        edges(f, &self.outputs)?;
        f.write_str("]")
    }
}

/// Failure policy for nodes the compiler cannot lower
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    /// Emit custom layers instead of failing
    pub add_custom_layers: bool,
    /// Nodes lowered to custom layers so far
    pub custom_layer_nodes: Vec<CustomLayerNode>,
    hint: &'static str,
}

impl ErrorHandler {
    pub fn new(add_custom_layers: bool, dialect: Dialect) -> Self {
        Self {
            add_custom_layers,
            custom_layer_nodes: Vec::new(),
            hint: dialect.unsupported_hint(),
        }
    }

    fn unsupported_op_error(&self, node: &Node) -> ConvertError {
        ConvertError::UnsupportedOp {
            op_types: node.op_type.clone(),
            node: Some(node.name.clone()),
            hint: self.hint.to_string(),
        }
    }

    /// Emit a custom layer standing in for `node`
    ///
    /// Constant inputs are not wired; their values live in the node.
    fn emit_custom(
        &mut self,
        builder: &mut dyn SpecBuilder,
        graph: &Graph,
        node: &Node,
    ) -> ConvertResult<()> {
        let inputs: Vec<&str> = node
            .inputs
            .iter()
            .filter(|i| !i.is_empty() && !node.input_tensors.contains_key(*i))
            .map(String::as_str)
            .collect();
        let outputs: Vec<&str> = node.outputs.iter().map(String::as_str).collect();
        builder.emit(
            &node.name,
            &inputs,
            &outputs,
            LayerKind::Custom {
                class_name: node.op_type.clone(),
                description: format!(
                    "Custom layer that corresponds to the ONNX op {}",
                    node.op_type
                ),
                parameters: custom_parameters(&node.attrs),
            },
        )?;
        warn!(node = %node.name, op_type = %node.op_type, "emitted custom layer");
        self.custom_layer_nodes
            .push(CustomLayerNode::capture(node, graph));
        Ok(())
    }
}

/// Attributes a custom layer can carry; tensor and string-list values are dropped
fn custom_parameters(attrs: &Attributes) -> IndexMap<String, CustomParam> {
    attrs
        .iter()
        .filter_map(|(k, v)| {
            let param = match v {
                AttrValue::Int(i) => CustomParam::Int(*i),
                AttrValue::Float(x) => CustomParam::Float(*x),
                AttrValue::String(s) => CustomParam::String(s.clone()),
                AttrValue::Ints(v) => CustomParam::Ints(v.clone()),
                AttrValue::Floats(v) => CustomParam::Floats(v.clone()),
                AttrValue::Tensor(_) | AttrValue::Strings(_) => return None,
            };
            Some((k.clone(), param))
        })
        .collect()
}

// ============================================================================
// Lowering context
// ============================================================================

/// Everything a lowering function reads and writes
pub struct LoweringCx<'a> {
    pub builder: &'a mut dyn SpecBuilder,
    pub graph: &'a mut Graph,
    pub err: &'a mut ErrorHandler,
}

impl<'a> LoweringCx<'a> {
    pub fn new(
        builder: &'a mut dyn SpecBuilder,
        graph: &'a mut Graph,
        err: &'a mut ErrorHandler,
    ) -> Self {
        Self {
            builder,
            graph,
            err,
        }
    }

    pub fn emit(
        &mut self,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        kind: LayerKind,
    ) -> ConvertResult<()> {
        self.builder.emit(name, inputs, outputs, kind)
    }

    /// Single-input single-output layer
    pub fn emit1(&mut self, name: &str, input: &str, output: &str, kind: LayerKind) -> ConvertResult<()> {
        self.builder.emit(name, &[input], &[output], kind)
    }

    /// `LINEAR(1, 0)` pass-through
    pub fn identity(&mut self, name: &str, input: &str, output: &str) -> ConvertResult<()> {
        self.emit1(
            name,
            input,
            output,
            LayerKind::Activation {
                activation: Activation::identity(),
            },
        )
    }

    // ---- failures ----

    /// No lowering for this node
    pub fn unsupported_op(&mut self, node: &Node) -> ConvertResult<()> {
        if !self.err.add_custom_layers {
            return Err(self.err.unsupported_op_error(node));
        }
        self.err.emit_custom(self.builder, self.graph, node)
    }

    /// The node's configuration is outside what the lowering handles
    pub fn reject(&mut self, node: &Node, reason: impl Into<String>) -> ConvertResult<()> {
        let reason = reason.into();
        if !self.err.add_custom_layers {
            return Err(ConvertError::config(&node.op_type, &node.name, reason));
        }
        debug!(node = %node.name, %reason, "configuration rejected, using custom layer");
        self.err.emit_custom(self.builder, self.graph, node)
    }

    /// A required constant is unknown; never absorbed by the escape hatch
    pub fn missing<T>(&self, node: &Node, message: impl Into<String>) -> ConvertResult<T> {
        Err(ConvertError::MissingInitializer {
            node: node.name.clone(),
            message: message.into(),
        })
    }

    /// Constant value of input `i`, or a missing-initializer failure
    pub fn require_const(
        &self,
        node: &Node,
        i: usize,
        message: &str,
    ) -> ConvertResult<crate::tensor::Tensor> {
        match node.input_tensor(i) {
            Some(t) => Ok(t.clone()),
            None => self.missing(node, message),
        }
    }

    // ---- shapes and ranks ----

    /// Known static shape of an edge
    pub fn shape(&self, edge: &str) -> Option<Vec<i64>> {
        self.graph.shape(edge).map(<[i64]>::to_vec)
    }

    /// Rank of an edge: the builder's record first, then the static shape
    pub fn rank(&self, edge: &str) -> Option<usize> {
        self.builder.rank(edge).or_else(|| self.graph.rank(edge))
    }

    // ---- axis map ----

    pub fn mapping(&self, edge: &str) -> Option<AxisMapping> {
        self.graph.axis_map.get(edge).map(|m| m.iter().copied().collect())
    }

    pub fn set_mapping(&mut self, edge: &str, mapping: AxisMapping) {
        self.graph.axis_map.insert(edge, mapping);
    }

    /// First output keeps the first input's mapping
    pub fn keep_mapping(&mut self, node: &Node) {
        if let Some(m) = self.mapping(node.first_input()) {
            self.set_mapping(node.first_output(), m);
        }
    }

    /// First output takes the mapping of the highest-rank mapped input
    pub fn broadcast_mapping(&mut self, node: &Node) {
        if self.mapping(node.first_input()).is_none() {
            return;
        }
        let mappings: Vec<&[Axis]> = node
            .inputs
            .iter()
            .filter_map(|i| self.graph.axis_map.get(i))
            .collect();
        if let Some(out) = crate::axis::rules::broadcast_output(&mappings) {
            self.set_mapping(node.first_output(), out);
        }
    }

    /// Run `body` between permutes that move a slot into a supported position
    ///
    /// Inputs are permuted into `{node}_{input}_transpose`, the body writes
    /// `{output}_transpose`, and the same permutation writes each original
    /// output.
    pub fn with_transpose<F>(
        &mut self,
        node: &Node,
        inputs: &[String],
        outputs: &[String],
        perm: TargetPerm,
        body: F,
    ) -> ConvertResult<()>
    where
        F: FnOnce(&mut Self, &[String], &[String]) -> ConvertResult<()>,
    {
        let mut wrapped_inputs = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let wrapped = format!("{}_{}_transpose", node.name, input);
            self.emit1(
                &format!("{}_input_transpose{}", node.name, i),
                input,
                &wrapped,
                LayerKind::Permute { axes: perm },
            )?;
            wrapped_inputs.push(wrapped);
        }
        let wrapped_outputs: Vec<String> =
            outputs.iter().map(|o| format!("{}_transpose", o)).collect();

        body(self, &wrapped_inputs, &wrapped_outputs)?;

        for (i, (wrapped, output)) in wrapped_outputs.iter().zip(outputs).enumerate() {
            self.emit1(
                &format!("{}_output_transpose{}", node.name, i),
                wrapped,
                output,
                LayerKind::Permute { axes: perm },
            )?;
        }
        Ok(())
    }
}

/// Borrow a list of owned names as `&str`
pub(crate) fn strs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

/// Integer list from an attribute, else from constant input `input`
pub(crate) fn ints_attr_or_input(node: &Node, key: &str, input: usize) -> Option<Vec<i64>> {
    node.attrs
        .ints(key)
        .or_else(|| node.input_tensor(input).map(crate::tensor::tensor_to_i64))
}

/// Float attribute, else the single value of constant input `input`
pub(crate) fn float_attr_or_input(node: &Node, key: &str, input: usize) -> Option<f32> {
    node.attrs
        .float(key)
        .or_else(|| node.input_tensor(input).and_then(|t| t.iter().next().copied()))
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::builder::{FeatureDescription, FeatureType, NetworkKind, NeuralNetworkSpec};
    use crate::graph::{EdgeInfo, Graph, Node, ShapeDict};

    /// Spec with one rank-4 input `x` and output `y`
    pub fn spec(version: u32) -> NeuralNetworkSpec {
        NeuralNetworkSpec::new(
            vec![FeatureDescription::new("x", FeatureType::array(vec![1, 3, 4, 4]))],
            vec![FeatureDescription::new("y", FeatureType::array(vec![1, 3, 4, 4]))],
            NetworkKind::NeuralNetwork,
            version,
        )
    }

    /// Spec whose input `x` has `shape`
    pub fn spec_with(version: u32, shape: &[i64]) -> NeuralNetworkSpec {
        NeuralNetworkSpec::new(
            vec![FeatureDescription::new("x", FeatureType::array(shape.to_vec()))],
            vec![FeatureDescription::new("y", FeatureType::array(vec![]))],
            NetworkKind::NeuralNetwork,
            version,
        )
    }

    /// Graph over `nodes` with input `x` of `shape`
    pub fn graph(nodes: Vec<Node>, shape: &[i64]) -> Graph {
        let mut shapes = ShapeDict::default();
        shapes.insert("x".into(), shape.to_vec());
        Graph::new(
            nodes,
            vec![EdgeInfo::new("x", 1, shape.to_vec())],
            vec![EdgeInfo::new("y", 1, vec![])],
            shapes,
        )
        .unwrap()
    }
}
