//! Compile configuration
//!
//! [`ConvertConfig`] is built directly or from JSON. Custom lowering
//! functions are closures and are attached with builder methods only.
//!
//! ```ignore
//! let config = ConvertConfig::from_json(r#"{
//!     "target": "13",
//!     "mode": "classifier",
//!     "class_labels": ["cat", "dog"],
//!     "image_input_names": ["image"],
//!     "preprocessing": { "image_scale": 0.0078, "red_bias": -1.0 }
//! }"#)?;
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::builder::{
    ImageArgs, NetworkKind, IOS11_2_SPEC_VERSION, IOS12_SPEC_VERSION, IOS13_SPEC_VERSION,
};
use crate::error::{ConvertError, ConvertResult};
use crate::lowering::{CustomLowering, Dialect, LoweringOverrides};

// ============================================================================
// Target
// ============================================================================

/// Minimum deployment target of the produced spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum TargetVersion {
    #[serde(rename = "11.2")]
    Ios11_2,
    #[default]
    #[serde(rename = "12")]
    Ios12,
    #[serde(rename = "13")]
    Ios13,
}

impl TargetVersion {
    /// Specification version marker written into the spec
    pub fn spec_version(self) -> u32 {
        match self {
            TargetVersion::Ios11_2 => IOS11_2_SPEC_VERSION,
            TargetVersion::Ios12 => IOS12_SPEC_VERSION,
            TargetVersion::Ios13 => IOS13_SPEC_VERSION,
        }
    }

    /// Lowering dialect this target compiles with
    pub fn dialect(self) -> Dialect {
        match self {
            TargetVersion::Ios13 => Dialect::Nd,
            TargetVersion::Ios11_2 | TargetVersion::Ios12 => Dialect::Legacy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetVersion::Ios11_2 => "11.2",
            TargetVersion::Ios12 => "12",
            TargetVersion::Ios13 => "13",
        }
    }
}

impl FromStr for TargetVersion {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "11.2" => Ok(TargetVersion::Ios11_2),
            "12" => Ok(TargetVersion::Ios12),
            "13" => Ok(TargetVersion::Ios13),
            other => Err(ConvertError::InvalidConfig(format!(
                "{} not supported. Please provide one of target iOS: 11.2, 12, 13",
                other
            ))),
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Class labels
// ============================================================================

/// Where classifier labels come from
///
/// In JSON a string is a file path and an array is the label list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClassLabels {
    List(Vec<String>),
    File(PathBuf),
}

impl ClassLabels {
    /// Resolve to the label list; file lines are trimmed
    pub fn load(&self) -> ConvertResult<Vec<String>> {
        match self {
            ClassLabels::List(labels) => Ok(labels.clone()),
            ClassLabels::File(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(text.lines().map(|l| l.trim().to_string()).collect())
            }
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Options of one compile
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Deployment target; `"13"` selects the arbitrary-rank layers
    pub target: TargetVersion,
    /// Network wrapper
    pub mode: NetworkKind,
    /// Inputs declared as images
    pub image_input_names: Vec<String>,
    /// Outputs declared as images
    pub image_output_names: Vec<String>,
    /// Scale and bias applied to image inputs
    pub preprocessing: ImageArgs,
    /// Scale and bias applied to image outputs
    pub deprocessing: ImageArgs,
    /// Labels of a classifier
    pub class_labels: Option<ClassLabels>,
    /// Name of the predicted-label output of a classifier
    pub predicted_feature_name: String,
    /// Emit custom layers for nodes that cannot be lowered
    pub add_custom_layers: bool,
    /// Explicit axis assignment per model input (legacy dialect)
    pub input_axis_map: IndexMap<String, Vec<i64>>,
    #[serde(skip)]
    overrides: LoweringOverrides,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            target: TargetVersion::default(),
            mode: NetworkKind::default(),
            image_input_names: Vec::new(),
            image_output_names: Vec::new(),
            preprocessing: ImageArgs::default(),
            deprocessing: ImageArgs::default(),
            class_labels: None,
            predicted_feature_name: "classLabel".to_string(),
            add_custom_layers: false,
            input_axis_map: IndexMap::new(),
            overrides: LoweringOverrides::new(),
        }
    }
}

impl ConvertConfig {
    pub fn new(target: TargetVersion) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Parse from JSON; absent fields keep their defaults
    pub fn from_json(json: &str) -> ConvertResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Lower the node called `node_name` with `f`
    pub fn with_node_override(mut self, node_name: impl Into<String>, f: CustomLowering) -> Self {
        self.overrides.insert_node(node_name, f);
        self
    }

    /// Lower every node of `op_type` with `f`
    pub fn with_op_override(mut self, op_type: impl Into<String>, f: CustomLowering) -> Self {
        self.overrides.insert_op(op_type, f);
        self
    }

    pub fn with_custom_layers(mut self, enabled: bool) -> Self {
        self.add_custom_layers = enabled;
        self
    }

    pub fn overrides(&self) -> &LoweringOverrides {
        &self.overrides
    }

    /// Reject combinations the compile cannot honor
    pub fn validate(&self) -> ConvertResult<()> {
        if self.class_labels.is_some() && self.mode != NetworkKind::Classifier {
            return Err(ConvertError::InvalidConfig(
                "class_labels is only valid with mode \"classifier\"".to_string(),
            ));
        }
        if let Some(name) = self
            .image_output_names
            .iter()
            .find(|n| self.image_input_names.contains(n))
        {
            return Err(ConvertError::InvalidConfig(format!(
                "'{}' is listed as both an image input and an image output",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PerImage;
    use crate::graph::Node;
    use crate::lowering::LoweringCx;
    use std::sync::Arc;

    #[test]
    fn test_target_parse() {
        assert_eq!("11.2".parse::<TargetVersion>().unwrap(), TargetVersion::Ios11_2);
        assert_eq!("13".parse::<TargetVersion>().unwrap().spec_version(), 4);
        assert_eq!(TargetVersion::Ios12.spec_version(), 3);
        assert_eq!(TargetVersion::Ios13.dialect(), Dialect::Nd);
        assert_eq!(TargetVersion::Ios11_2.dialect(), Dialect::Legacy);
        assert!("14".parse::<TargetVersion>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ConvertConfig::default();
        assert_eq!(config.target, TargetVersion::Ios12);
        assert_eq!(config.mode, NetworkKind::NeuralNetwork);
        assert_eq!(config.predicted_feature_name, "classLabel");
        assert!(!config.add_custom_layers);
        assert!(config.overrides().is_empty());
    }

    #[test]
    fn test_from_json() {
        let config = ConvertConfig::from_json(
            r#"{
                "target": "13",
                "mode": "classifier",
                "class_labels": ["a", "b"],
                "image_input_names": ["img"],
                "preprocessing": {"image_scale": 0.5, "red_bias": {"img": -1.0}},
                "input_axis_map": {"seq": [0, 1, 2]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.target, TargetVersion::Ios13);
        assert_eq!(config.mode, NetworkKind::Classifier);
        assert_eq!(
            config.class_labels,
            Some(ClassLabels::List(vec!["a".into(), "b".into()]))
        );
        assert_eq!(config.preprocessing.image_scale, Some(PerImage::All(0.5)));
        assert_eq!(config.preprocessing.red("img"), -1.0);
        assert_eq!(config.preprocessing.red("other"), 0.0);
        assert_eq!(config.input_axis_map["seq"], vec![0, 1, 2]);
        config.validate().unwrap();
    }

    #[test]
    fn test_label_file_path() {
        let config = ConvertConfig::from_json(
            r#"{"mode": "classifier", "class_labels": "labels.txt"}"#,
        )
        .unwrap();
        assert_eq!(
            config.class_labels,
            Some(ClassLabels::File(PathBuf::from("labels.txt")))
        );
    }

    #[test]
    fn test_label_file_lines_trimmed() {
        let path = std::env::temp_dir().join("onnx_coreml_labels_test.txt");
        std::fs::write(&path, "cat \n  dog\n").unwrap();
        let labels = ClassLabels::File(path.clone()).load().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(labels, vec!["cat", "dog"]);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            ConvertConfig::from_json(r#"{"target": "10"}"#),
            Err(ConvertError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut config = ConvertConfig::default();
        config.class_labels = Some(ClassLabels::List(vec!["a".into()]));
        assert!(config.validate().is_err());

        let mut config = ConvertConfig::default();
        config.image_input_names = vec!["x".into()];
        config.image_output_names = vec!["x".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_attach() {
        let f: CustomLowering = Arc::new(|cx: &mut LoweringCx<'_>, node: &Node| {
            cx.identity(&node.name, node.first_input(), node.first_output())
        });
        let config = ConvertConfig::default()
            .with_node_override("n0", f.clone())
            .with_op_override("Foo", f);
        assert_eq!(config.overrides().len(), 2);
    }
}
