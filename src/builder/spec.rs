//! In-memory target model specification
//!
//! [`NeuralNetworkSpec`] is what a compile produces: the interface
//! description, image preprocessing, classifier labels and the ordered
//! layer list. It implements [`SpecBuilder`], the emission surface the
//! lowering tables write through.

#![allow(missing_docs)]

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ConvertError, ConvertResult};
use crate::graph::EdgeInfo;
use crate::tensor::ArrayDataType;

use super::layers::{Layer, LayerKind};

/// Specification version of each supported target
pub const IOS11_2_SPEC_VERSION: u32 = 2;
/// Specification version of target `"12"`
pub const IOS12_SPEC_VERSION: u32 = 3;
/// Specification version of target `"13"`
pub const IOS13_SPEC_VERSION: u32 = 4;

/// Target label for a specification version
pub fn target_label(spec_version: u32) -> &'static str {
    match spec_version {
        0..=IOS11_2_SPEC_VERSION => "11.2",
        IOS12_SPEC_VERSION => "12",
        _ => "13",
    }
}

// ============================================================================
// Description
// ============================================================================

/// Color layout of an image feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColorSpace {
    Grayscale,
    Rgb,
    Bgr,
}

/// Type of a model input or output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FeatureType {
    /// Dense array; `shape` is `None` when left to the runtime
    MultiArray {
        shape: Option<Vec<i64>>,
        data_type: ArrayDataType,
    },
    /// Image of fixed size
    Image {
        width: i64,
        height: i64,
        color_space: ColorSpace,
    },
    /// Class probabilities keyed by label
    StringDictionary,
    /// Predicted label
    String,
}

impl FeatureType {
    /// Float multi-array of a known shape
    pub fn array(shape: Vec<i64>) -> Self {
        FeatureType::MultiArray {
            shape: Some(shape),
            data_type: ArrayDataType::Double,
        }
    }

    /// Multi-array shape, if this is one and it is declared
    pub fn array_shape(&self) -> Option<&[i64]> {
        match self {
            FeatureType::MultiArray { shape, .. } => shape.as_deref(),
            _ => None,
        }
    }
}

/// One model input or output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureDescription {
    pub name: String,
    pub short_description: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    pub optional: bool,
}

impl FeatureDescription {
    /// Required feature with no description text
    pub fn new(name: impl Into<String>, feature_type: FeatureType) -> Self {
        Self {
            name: name.into(),
            short_description: String::new(),
            feature_type,
            optional: false,
        }
    }
}

/// Interface of the model
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelDescription {
    pub inputs: Vec<FeatureDescription>,
    pub outputs: Vec<FeatureDescription>,
    pub predicted_feature_name: Option<String>,
    pub predicted_probabilities_name: Option<String>,
}

/// Which network wrapper the spec declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    #[serde(alias = "none")]
    NeuralNetwork,
    Classifier,
    Regressor,
}

// ============================================================================
// Image preprocessing
// ============================================================================

/// A value given once for every image, or per image name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerImage<T> {
    All(T),
    ByName(IndexMap<String, T>),
}

impl<T: Copy> PerImage<T> {
    /// Value for `name`, if one applies
    pub fn get(&self, name: &str) -> Option<T> {
        match self {
            PerImage::All(v) => Some(*v),
            PerImage::ByName(map) => map.get(name).copied(),
        }
    }

    /// Set the value for one image, keeping values of the others
    pub fn set(slot: &mut Option<Self>, name: &str, value: T) {
        match slot {
            Some(PerImage::ByName(map)) => {
                map.insert(name.to_string(), value);
            }
            _ => {
                let mut map = IndexMap::new();
                map.insert(name.to_string(), value);
                *slot = Some(PerImage::ByName(map));
            }
        }
    }
}

/// Scale, bias and channel order of image features
///
/// Unset fields keep the target defaults (`1.0` scale, `0.0` bias, RGB).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageArgs {
    pub is_bgr: Option<PerImage<bool>>,
    pub red_bias: Option<PerImage<f32>>,
    pub green_bias: Option<PerImage<f32>>,
    pub blue_bias: Option<PerImage<f32>>,
    pub gray_bias: Option<PerImage<f32>>,
    pub image_scale: Option<PerImage<f32>>,
}

impl ImageArgs {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        self.provided() == 0
    }

    /// Whether `is_bgr` is the only field set
    pub fn is_bgr_only(&self) -> bool {
        self.provided() == 1 && self.is_bgr.is_some()
    }

    fn provided(&self) -> usize {
        [
            self.is_bgr.is_some(),
            self.red_bias.is_some(),
            self.green_bias.is_some(),
            self.blue_bias.is_some(),
            self.gray_bias.is_some(),
            self.image_scale.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count()
    }

    pub fn bgr(&self, name: &str) -> bool {
        self.is_bgr.as_ref().and_then(|v| v.get(name)).unwrap_or(false)
    }

    pub fn scale(&self, name: &str) -> f32 {
        pick(&self.image_scale, name, 1.0)
    }

    pub fn red(&self, name: &str) -> f32 {
        pick(&self.red_bias, name, 0.0)
    }

    pub fn green(&self, name: &str) -> f32 {
        pick(&self.green_bias, name, 0.0)
    }

    pub fn blue(&self, name: &str) -> f32 {
        pick(&self.blue_bias, name, 0.0)
    }

    pub fn gray(&self, name: &str) -> f32 {
        pick(&self.gray_bias, name, 0.0)
    }
}

fn pick(slot: &Option<PerImage<f32>>, name: &str, default: f32) -> f32 {
    slot.as_ref().and_then(|v| v.get(name)).unwrap_or(default)
}

/// Per-feature image scaler applied before the first layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageScaler {
    pub feature_name: String,
    pub channel_scale: f32,
    pub red_bias: f32,
    pub green_bias: f32,
    pub blue_bias: f32,
    pub gray_bias: f32,
}

/// `(channels, height, width)` of an image-shaped array
fn image_dims(shape: &[i64], feature: &str) -> ConvertResult<(i64, i64, i64)> {
    match shape {
        [c, h, w] | [_, c, h, w] => Ok((*c, *h, *w)),
        _ => Err(ConvertError::InvalidConfig(format!(
            "image feature '{}' has rank {}, expected rank 3 or 4",
            feature,
            shape.len()
        ))),
    }
}

// ============================================================================
// Builder surface
// ============================================================================

/// Emission surface the lowering tables write through
///
/// Layers are appended in order. The builder tracks the rank of every blob
/// it has seen so arbitrary-rank lowering can ask for it.
pub trait SpecBuilder {
    /// Append a layer; layer names must be unique
    fn add_layer(&mut self, layer: Layer) -> ConvertResult<()>;

    /// Layers emitted so far
    fn layers(&self) -> &[Layer];

    /// Rank of a blob, `None` if unknown
    fn rank(&self, blob: &str) -> Option<usize>;

    /// Overwrite the recorded rank of a blob
    fn set_rank(&mut self, blob: &str, rank: Option<usize>);

    /// Declared specification version
    fn spec_version(&self) -> u32;

    /// Mark image inputs and attach their scalers
    fn set_pre_processing_parameters(
        &mut self,
        image_input_names: &[String],
        args: &ImageArgs,
    ) -> ConvertResult<()>;

    /// Turn the spec into a classifier over `labels`
    fn set_class_labels(
        &mut self,
        labels: Vec<String>,
        predicted_feature_name: &str,
        prediction_blob: Option<&str>,
    ) -> ConvertResult<()>;

    /// Register optional inputs and outputs
    fn add_optionals(&mut self, inputs: &[EdgeInfo], outputs: &[EdgeInfo]);

    /// Append a layer built from its parts
    fn emit(
        &mut self,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        kind: LayerKind,
    ) -> ConvertResult<()> {
        self.add_layer(Layer::new(name, inputs, outputs, kind))
    }
}

/// The compiled target model
#[derive(Debug, Clone, Serialize)]
pub struct NeuralNetworkSpec {
    pub specification_version: u32,
    pub kind: NetworkKind,
    pub description: ModelDescription,
    /// Blobs keep their declared rank instead of the rank-5 layout
    pub exact_array_mapping: bool,
    pub preprocessing: Vec<ImageScaler>,
    pub class_labels: Vec<String>,
    pub label_probability_layer_name: Option<String>,
    pub layers: Vec<Layer>,
    #[serde(skip)]
    ranks: FxHashMap<String, Option<usize>>,
    #[serde(skip)]
    layer_names: FxHashSet<String>,
}

impl NeuralNetworkSpec {
    /// Empty network over the given interface
    pub fn new(
        inputs: Vec<FeatureDescription>,
        outputs: Vec<FeatureDescription>,
        kind: NetworkKind,
        specification_version: u32,
    ) -> Self {
        let ranks = inputs
            .iter()
            .map(|f| (f.name.clone(), f.feature_type.array_shape().map(<[i64]>::len)))
            .collect();
        Self {
            specification_version,
            kind,
            description: ModelDescription {
                inputs,
                outputs,
                ..ModelDescription::default()
            },
            exact_array_mapping: specification_version >= IOS13_SPEC_VERSION,
            preprocessing: Vec::new(),
            class_labels: Vec::new(),
            label_probability_layer_name: None,
            layers: Vec::new(),
            ranks,
            layer_names: FxHashSet::default(),
        }
    }

    /// Layer by name
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Mutable layer list; names are re-indexed on the next insertion
    pub fn layers_mut(&mut self) -> &mut Vec<Layer> {
        self.layer_names.clear();
        &mut self.layers
    }

    /// Input feature by name
    pub fn input_mut(&mut self, name: &str) -> Option<&mut FeatureDescription> {
        self.description.inputs.iter_mut().find(|f| f.name == name)
    }

    /// Output feature by name
    pub fn output_mut(&mut self, name: &str) -> Option<&mut FeatureDescription> {
        self.description.outputs.iter_mut().find(|f| f.name == name)
    }

    /// Turn a multi-array output into an image output
    ///
    /// Rank 2 is grayscale; `[C, H, W]` or `[1, C, H, W]` needs one or
    /// three channels.
    pub fn convert_output_to_image(&mut self, name: &str, is_bgr: bool) -> ConvertResult<()> {
        let Some(feature) = self.output_mut(name) else {
            return Ok(());
        };
        let shape = match &feature.feature_type {
            FeatureType::MultiArray { shape, .. } => shape.clone().unwrap_or_default(),
            _ => {
                return Err(ConvertError::InvalidConfig(format!(
                    "{} is not a multiarray type",
                    name
                )))
            }
        };

        let (color_space, height, width) = match shape.as_slice() {
            [h, w] => (ColorSpace::Grayscale, *h, *w),
            [n, ..] if shape.len() == 4 && *n != 1 => {
                return Err(ConvertError::InvalidConfig(format!(
                    "Shape {:?} is not supported for image output",
                    shape
                )))
            }
            _ => {
                let (c, h, w) = image_dims(&shape, name)?;
                let color_space = match (c, is_bgr) {
                    (1, _) => ColorSpace::Grayscale,
                    (3, true) => ColorSpace::Bgr,
                    (3, false) => ColorSpace::Rgb,
                    _ => {
                        return Err(ConvertError::InvalidConfig(format!(
                            "Channel Value {} is not supported for image output",
                            c
                        )))
                    }
                };
                (color_space, h, w)
            }
        };
        feature.feature_type = FeatureType::Image {
            width,
            height,
            color_space,
        };
        Ok(())
    }

    /// Layers the declared specification version cannot carry are an error
    pub fn check_capability(&self) -> ConvertResult<()> {
        for layer in &self.layers {
            if layer.kind.min_spec_version() > self.specification_version {
                return Err(ConvertError::SpecCapability {
                    feature: layer.kind.type_name().to_string(),
                    target: target_label(self.specification_version).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ConvertResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to indented JSON
    pub fn to_json_pretty(&self) -> ConvertResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl SpecBuilder for NeuralNetworkSpec {
    fn add_layer(&mut self, layer: Layer) -> ConvertResult<()> {
        if self.layer_names.is_empty() && !self.layers.is_empty() {
            self.layer_names = self.layers.iter().map(|l| l.name.clone()).collect();
        }
        if !self.layer_names.insert(layer.name.clone()) {
            return Err(ConvertError::Structural(format!(
                "Layer with name \"{}\" has already been added",
                layer.name
            )));
        }

        let input_ranks: Vec<Option<usize>> =
            layer.inputs.iter().map(|i| self.rank(i)).collect();
        let rank = layer.kind.output_rank(&input_ranks);
        for output in &layer.outputs {
            self.ranks.insert(output.clone(), rank);
        }
        trace!(layer = %layer.name, kind = layer.kind.type_name(), "emit layer");
        self.layers.push(layer);
        Ok(())
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn rank(&self, blob: &str) -> Option<usize> {
        self.ranks.get(blob).copied().flatten()
    }

    fn set_rank(&mut self, blob: &str, rank: Option<usize>) {
        self.ranks.insert(blob.to_string(), rank);
    }

    fn spec_version(&self) -> u32 {
        self.specification_version
    }

    fn set_pre_processing_parameters(
        &mut self,
        image_input_names: &[String],
        args: &ImageArgs,
    ) -> ConvertResult<()> {
        for name in image_input_names {
            let Some(feature) = self.input_mut(name) else {
                continue;
            };
            if let Some(shape) = feature.feature_type.array_shape() {
                let (c, height, width) = image_dims(shape, name)?;
                let color_space = match c {
                    1 => ColorSpace::Grayscale,
                    3 if args.bgr(name) => ColorSpace::Bgr,
                    3 => ColorSpace::Rgb,
                    _ => {
                        return Err(ConvertError::InvalidConfig(format!(
                            "Channel Value {} not supported for image inputs",
                            c
                        )))
                    }
                };
                feature.feature_type = FeatureType::Image {
                    width,
                    height,
                    color_space,
                };
            }
            self.preprocessing.push(ImageScaler {
                feature_name: name.clone(),
                channel_scale: args.scale(name),
                red_bias: args.red(name),
                green_bias: args.green(name),
                blue_bias: args.blue(name),
                gray_bias: args.gray(name),
            });
        }
        Ok(())
    }

    fn set_class_labels(
        &mut self,
        labels: Vec<String>,
        predicted_feature_name: &str,
        prediction_blob: Option<&str>,
    ) -> ConvertResult<()> {
        let probabilities = self.description.outputs.first_mut().ok_or_else(|| {
            ConvertError::InvalidConfig(
                "Model should have at least one output (the probabilities) to make it a classifier"
                    .to_string(),
            )
        })?;
        probabilities.feature_type = FeatureType::StringDictionary;
        if labels.is_empty() {
            return Ok(());
        }
        let probabilities_name = probabilities.name.clone();

        self.description.predicted_probabilities_name = Some(probabilities_name);
        self.description.predicted_feature_name = Some(predicted_feature_name.to_string());
        self.description.outputs.push(FeatureDescription::new(
            predicted_feature_name,
            FeatureType::String,
        ));
        self.class_labels = labels;
        self.kind = NetworkKind::Classifier;
        self.label_probability_layer_name = match prediction_blob {
            Some(blob) => Some(blob.to_string()),
            None => self
                .layers
                .last()
                .and_then(|l| l.outputs.first())
                .cloned(),
        };
        Ok(())
    }

    fn add_optionals(&mut self, inputs: &[EdgeInfo], outputs: &[EdgeInfo]) {
        let optional = |edge: &EdgeInfo| FeatureDescription {
            optional: true,
            ..FeatureDescription::new(
                edge.name.clone(),
                FeatureType::MultiArray {
                    shape: (!edge.shape.is_empty()).then(|| edge.shape.clone()),
                    data_type: ArrayDataType::Double,
                },
            )
        };
        for edge in inputs {
            self.ranks.insert(edge.name.clone(), Some(edge.shape.len()));
            self.description.inputs.push(optional(edge));
        }
        for edge in outputs {
            self.description.outputs.push(optional(edge));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::layers::Activation;

    fn relu(name: &str, input: &str, output: &str) -> Layer {
        Layer::unary(
            name,
            input,
            output,
            LayerKind::Activation {
                activation: Activation::Relu,
            },
        )
    }

    fn spec(version: u32) -> NeuralNetworkSpec {
        NeuralNetworkSpec::new(
            vec![FeatureDescription::new("x", FeatureType::array(vec![3, 8, 8]))],
            vec![FeatureDescription::new(
                "y",
                FeatureType::MultiArray {
                    shape: None,
                    data_type: ArrayDataType::Float32,
                },
            )],
            NetworkKind::NeuralNetwork,
            version,
        )
    }

    #[test]
    fn test_duplicate_layer_rejected() {
        let mut s = spec(IOS12_SPEC_VERSION);
        s.add_layer(relu("r", "x", "y")).unwrap();
        assert!(matches!(
            s.add_layer(relu("r", "y", "z")),
            Err(ConvertError::Structural(_))
        ));
        assert_eq!(s.rank("y"), Some(3));
        assert_eq!(s.rank("missing"), None);
    }

    #[test]
    fn test_capability_check() {
        let mut s = spec(IOS11_2_SPEC_VERSION);
        s.add_layer(Layer::unary(
            "resize",
            "x",
            "y",
            LayerKind::ResizeBilinear {
                target_height: 16,
                target_width: 16,
                mode: crate::builder::layers::ResizeMode::StrictAlignEndpoints,
            },
        ))
        .unwrap();
        let err = s.check_capability().unwrap_err();
        assert!(matches!(err, ConvertError::SpecCapability { .. }));
        assert!(err.to_string().contains("resizeBilinear"));
        assert!(err.to_string().contains("11.2"));

        s.specification_version = IOS12_SPEC_VERSION;
        assert!(s.check_capability().is_ok());
    }

    #[test]
    fn test_preprocessing_marks_image() {
        let mut s = spec(IOS12_SPEC_VERSION);
        let mut args = ImageArgs::default();
        PerImage::set(&mut args.red_bias, "x", -1.0);
        args.is_bgr = Some(PerImage::All(true));
        s.set_pre_processing_parameters(&["x".to_string()], &args)
            .unwrap();

        assert_eq!(
            s.description.inputs[0].feature_type,
            FeatureType::Image {
                width: 8,
                height: 8,
                color_space: ColorSpace::Bgr
            }
        );
        assert_eq!(s.preprocessing[0].red_bias, -1.0);
        assert_eq!(s.preprocessing[0].channel_scale, 1.0);
        assert!(!args.is_bgr_only());
    }

    #[test]
    fn test_class_labels() {
        let mut s = spec(IOS12_SPEC_VERSION);
        s.add_layer(relu("r", "x", "y")).unwrap();
        s.set_class_labels(vec!["cat".into(), "dog".into()], "classLabel", None)
            .unwrap();

        assert_eq!(s.kind, NetworkKind::Classifier);
        assert_eq!(s.description.outputs.len(), 2);
        assert_eq!(s.description.outputs[0].feature_type, FeatureType::StringDictionary);
        assert_eq!(s.label_probability_layer_name.as_deref(), Some("y"));
        assert_eq!(s.description.predicted_feature_name.as_deref(), Some("classLabel"));
    }

    #[test]
    fn test_output_to_image() {
        let mut s = spec(IOS12_SPEC_VERSION);
        s.description.outputs[0].feature_type = FeatureType::array(vec![1, 3, 4, 5]);
        s.convert_output_to_image("y", false).unwrap();
        assert_eq!(
            s.description.outputs[0].feature_type,
            FeatureType::Image {
                width: 5,
                height: 4,
                color_space: ColorSpace::Rgb
            }
        );

        s.description.outputs[0].feature_type = FeatureType::array(vec![2, 4, 5]);
        assert!(s.convert_output_to_image("y", false).is_err());
    }

    #[test]
    fn test_json_output() {
        let mut s = spec(IOS13_SPEC_VERSION);
        s.add_layer(relu("r", "x", "y")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(json["specification_version"], 4);
        assert_eq!(json["exact_array_mapping"], true);
        assert_eq!(json["layers"][0]["name"], "r");
        assert!(json.get("ranks").is_none());
    }
}
