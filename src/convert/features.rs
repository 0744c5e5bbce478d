//! Model interface extraction
//!
//! Graph inputs and outputs become target feature descriptions. Under the
//! legacy dialect each input also seeds the axis map.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::axis::init::is_sequence_op;
use crate::axis::input_layout;
use crate::axis::rules::describe_shape;
use crate::builder::{FeatureDescription, FeatureType, NeuralNetworkSpec};
use crate::error::{ConvertError, ConvertResult};
use crate::graph::{EdgeInfo, Graph};
use crate::lowering::Dialect;
use crate::tensor::ArrayDataType;

/// Highest rank an arbitrary-rank feature can declare
pub const MAX_FEATURE_RANK: usize = 5;

/// Ops whose rank-0 output is declared as `[1]`
const ZERO_RANK_OUTPUT_OPS: &[&str] = &["Size"];

fn array(edge: &EdgeInfo, shape: Option<Vec<i64>>) -> ConvertResult<FeatureDescription> {
    let data_type = ArrayDataType::from_onnx(edge.elem_type)?;
    Ok(FeatureDescription::new(
        edge.name.clone(),
        FeatureType::MultiArray { shape, data_type },
    ))
}

fn check_rank(edge: &EdgeInfo, kind: &str) -> ConvertResult<()> {
    if edge.shape.len() > MAX_FEATURE_RANK {
        return Err(ConvertError::UnsupportedConfiguration {
            op_type: kind.to_string(),
            node: edge.name.clone(),
            reason: format!(
                "ONNX {} {} has a rank greater than {}, which is not supported",
                kind.to_lowercase(),
                edge.name,
                MAX_FEATURE_RANK
            ),
        });
    }
    Ok(())
}

/// Input features of the target model
///
/// Legacy inputs are declared with the `[C, H, W]`-style shape of their
/// layout and their mapping is recorded in `graph.axis_map`. Arbitrary-rank
/// inputs keep their ONNX shape.
pub fn input_features(
    graph: &mut Graph,
    dialect: Dialect,
    axis_overrides: &IndexMap<String, Vec<i64>>,
) -> ConvertResult<Vec<FeatureDescription>> {
    if dialect == Dialect::Nd && !axis_overrides.is_empty() {
        warn!("input_axis_map is ignored with target 13");
    }

    let inputs = graph.inputs.clone();
    let mut features = Vec::with_capacity(inputs.len());
    for edge in &inputs {
        let shape = match dialect {
            Dialect::Nd => {
                check_rank(edge, "Input")?;
                edge.shape.clone()
            }
            Dialect::Legacy => {
                let consumers = graph
                    .blob_to_op_type
                    .get(&edge.name)
                    .cloned()
                    .unwrap_or_default();
                let user_map = axis_overrides.get(&edge.name).map(Vec::as_slice);
                let layout = input_layout(&edge.name, &edge.shape, &consumers, user_map)?;
                debug!(input = %edge.name, mapping = ?layout.mapping, "input axis map");
                graph.axis_map.insert(&edge.name, layout.mapping);
                layout.feature_shape
            }
        };
        features.push(array(edge, Some(shape))?);
    }
    Ok(features)
}

/// Output features of the target model
///
/// Legacy outputs leave the shape to the runtime unless `force_shape` is
/// set (image outputs need one), in which case the batch dimension is
/// dropped the same way it is for inputs.
pub fn output_features(
    graph: &Graph,
    dialect: Dialect,
    force_shape: bool,
) -> ConvertResult<Vec<FeatureDescription>> {
    let mut features = Vec::with_capacity(graph.outputs.len());
    for edge in &graph.outputs {
        let producer = graph.blob_from_op_type.get(&edge.name).map(String::as_str);
        let mut shape = edge.shape.clone();
        if shape.is_empty() && producer.is_some_and(|op| ZERO_RANK_OUTPUT_OPS.contains(&op)) {
            shape = vec![1];
        }

        let declared = match dialect {
            Dialect::Nd => {
                check_rank(edge, "Output")?;
                (!shape.is_empty()).then_some(shape)
            }
            Dialect::Legacy if !force_shape => None,
            Dialect::Legacy => match shape.len() {
                0 => Some(vec![1, 1, 1]),
                1 => Some(shape),
                3 if producer.is_some_and(is_sequence_op) => Some(vec![shape[2]]),
                3 => Some(shape),
                4 => Some(shape[1..].to_vec()),
                _ => None,
            },
        };
        features.push(array(edge, declared)?);
    }
    Ok(features)
}

/// Append the rank-5 view of every multi-array feature to its description
///
/// Inputs must agree with their axis mapping; outputs whose mapping and
/// shape disagree are left undescribed.
pub fn describe_rank5(spec: &mut NeuralNetworkSpec, graph: &Graph) -> ConvertResult<()> {
    let describe = |feature: &mut FeatureDescription, strict: bool| -> ConvertResult<()> {
        if !matches!(feature.feature_type, FeatureType::MultiArray { .. }) {
            return Ok(());
        }
        let (Some(mapping), Some(shape)) =
            (graph.axis_map.get(&feature.name), graph.shape(&feature.name))
        else {
            return Ok(());
        };
        match describe_shape(mapping, shape) {
            Some(dims) => {
                let dims: Vec<String> = dims.iter().map(i64::to_string).collect();
                feature.short_description.push_str(&format!(
                    "MultiArray of shape ({}). The first and second dimensions correspond to sequence and batch size, respectively",
                    dims.join(", ")
                ));
                Ok(())
            }
            None if strict => Err(ConvertError::Internal(format!(
                "axis mapping of '{}' has {} entries but its shape has rank {}",
                feature.name,
                mapping.len(),
                shape.len()
            ))),
            None => Ok(()),
        }
    };

    for feature in &mut spec.description.inputs {
        describe(feature, true)?;
    }
    for feature in &mut spec.description.outputs {
        describe(feature, false)?;
    }
    Ok(())
}
