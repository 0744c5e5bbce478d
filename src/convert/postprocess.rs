//! Image pre/deprocessing and optional feature registration

use indexmap::IndexMap;
use tracing::debug;

use crate::builder::{
    ColorSpace, FeatureType, ImageArgs, LayerKind, NeuralNetworkSpec, PerImage, SpecBuilder,
    WeightParams,
};
use crate::error::{ConvertError, ConvertResult};
use crate::graph::Graph;
use crate::transformers::{GraphTransformer, RenameOutputs};

/// Fill `args` from the graph's `ImageScaler` nodes
///
/// Each scaler's input becomes an image input. A three-element bias is
/// red, green, blue; a single element is the gray bias. Scalers with any
/// other bias length are left alone. Returns the number of scalers used.
pub fn extract_image_scalers(
    graph: &Graph,
    args: &mut ImageArgs,
    image_input_names: &mut Vec<String>,
) -> usize {
    let mut used = 0;
    for node in graph.nodes().iter().filter(|n| n.op_type == "ImageScaler") {
        let input = node.first_input();
        let scale = node.attrs.float_or("scale", 1.0);
        let bias = node.attrs.floats("bias").unwrap_or_else(|| vec![0.0; 3]);

        match bias.as_slice() {
            [r, g, b] => {
                PerImage::set(&mut args.red_bias, input, *r);
                PerImage::set(&mut args.green_bias, input, *g);
                PerImage::set(&mut args.blue_bias, input, *b);
            }
            [gray] => PerImage::set(&mut args.gray_bias, input, *gray),
            _ => continue,
        }
        PerImage::set(&mut args.image_scale, input, scale);
        if !image_input_names.iter().any(|n| n == input) {
            image_input_names.push(input.to_string());
        }
        debug!(node = %node.name, input, scale, ?bias, "image scaler folded into preprocessing");
        used += 1;
    }
    used
}

/// Whether image outputs get a scale layer
pub fn needs_deprocessing(image_output_names: &[String], args: &ImageArgs) -> bool {
    !image_output_names.is_empty() && !args.is_empty() && !args.is_bgr_only()
}

/// Redirect every graph output to a fresh edge so a deprocessing layer can
/// write the declared name; returns declared name → fresh edge
pub fn rename_outputs(graph: &mut Graph) -> ConvertResult<IndexMap<String, String>> {
    let mapping: IndexMap<String, String> = graph
        .outputs
        .iter()
        .map(|o| (o.name.clone(), graph.get_unique_edge_name(&o.name)))
        .collect();
    RenameOutputs::new(mapping.clone()).transform(graph)?;
    Ok(mapping)
}

/// Append the scale layer reading `source` and writing image output `output`
///
/// Grayscale outputs get one channel; color outputs get the biases in the
/// channel order of the output.
pub fn add_deprocessing(
    spec: &mut NeuralNetworkSpec,
    args: &ImageArgs,
    source: &str,
    output: &str,
) -> ConvertResult<()> {
    let color_space = match spec
        .description
        .outputs
        .iter()
        .find(|f| f.name == output)
        .map(|f| &f.feature_type)
    {
        Some(FeatureType::Image { color_space, .. }) => *color_space,
        _ => {
            return Err(ConvertError::InvalidConfig(
                "Output must be RGB image or Grayscale".to_string(),
            ))
        }
    };

    let scale = args.scale(output);
    let bias = match color_space {
        ColorSpace::Grayscale => vec![args.gray(output)],
        ColorSpace::Rgb => vec![args.red(output), args.green(output), args.blue(output)],
        ColorSpace::Bgr => vec![args.blue(output), args.green(output), args.red(output)],
    };
    let channels = bias.len();
    spec.emit(
        source,
        &[source],
        &[output],
        LayerKind::Scale {
            scale: WeightParams::filled(channels, scale),
            bias: Some(WeightParams::from_values(bias)),
            shape_scale: vec![channels],
            shape_bias: vec![channels],
        },
    )
}

/// Move the graph's optional edges from the required description to
/// optional features
pub fn register_optionals(spec: &mut NeuralNetworkSpec, graph: &Graph) {
    if graph.optional_inputs.is_empty() && graph.optional_outputs.is_empty() {
        return;
    }
    let optional_in = |name: &str| graph.optional_inputs.iter().any(|e| e.name == name);
    let optional_out = |name: &str| graph.optional_outputs.iter().any(|e| e.name == name);
    spec.description.inputs.retain(|f| !optional_in(&f.name));
    spec.description.outputs.retain(|f| !optional_out(&f.name));
    spec.add_optionals(&graph.optional_inputs, &graph.optional_outputs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FeatureDescription, NetworkKind};
    use crate::graph::{AttrValue, EdgeInfo, Node, ShapeDict};

    fn scaler_graph(bias: Vec<f32>) -> Graph {
        Graph::new(
            vec![
                Node::new("scaler", "ImageScaler", &["img"], &["scaled"])
                    .with_attr("scale", AttrValue::Float(0.5))
                    .with_attr("bias", AttrValue::Floats(bias)),
                Node::new("relu", "Relu", &["scaled"], &["y"]),
            ],
            vec![EdgeInfo::new("img", 1, vec![1, 3, 4, 4])],
            vec![EdgeInfo::new("y", 1, vec![1, 3, 4, 4])],
            ShapeDict::default(),
        )
        .unwrap()
    }

    fn image_spec(color_space: ColorSpace) -> NeuralNetworkSpec {
        NeuralNetworkSpec::new(
            vec![FeatureDescription::new("x", FeatureType::array(vec![3, 4, 4]))],
            vec![FeatureDescription::new(
                "y",
                FeatureType::Image {
                    width: 4,
                    height: 4,
                    color_space,
                },
            )],
            NetworkKind::NeuralNetwork,
            3,
        )
    }

    #[test]
    fn test_extract_rgb_scaler() {
        let g = scaler_graph(vec![-1.0, -2.0, -3.0]);
        let mut args = ImageArgs::default();
        let mut names = Vec::new();

        assert_eq!(extract_image_scalers(&g, &mut args, &mut names), 1);
        assert_eq!(names, vec!["img"]);
        assert_eq!(args.scale("img"), 0.5);
        assert_eq!(args.red("img"), -1.0);
        assert_eq!(args.blue("img"), -3.0);
        assert_eq!(args.gray("img"), 0.0);
    }

    #[test]
    fn test_extract_gray_and_skip_odd_bias() {
        let mut args = ImageArgs::default();
        let mut names = Vec::new();
        extract_image_scalers(&scaler_graph(vec![0.25]), &mut args, &mut names);
        assert_eq!(args.gray("img"), 0.25);

        let mut args = ImageArgs::default();
        let mut names = Vec::new();
        assert_eq!(
            extract_image_scalers(&scaler_graph(vec![1.0, 2.0]), &mut args, &mut names),
            0
        );
        assert!(args.is_empty());
        assert!(names.is_empty());
    }

    #[test]
    fn test_needs_deprocessing() {
        let names = vec!["y".to_string()];
        let mut args = ImageArgs::default();
        assert!(!needs_deprocessing(&names, &args));
        args.is_bgr = Some(PerImage::All(true));
        assert!(!needs_deprocessing(&names, &args));
        args.image_scale = Some(PerImage::All(255.0));
        assert!(needs_deprocessing(&names, &args));
        assert!(!needs_deprocessing(&[], &args));
    }

    #[test]
    fn test_rename_outputs() {
        let mut g = scaler_graph(vec![0.0; 3]);
        let mapping = rename_outputs(&mut g).unwrap();
        let fresh = &mapping["y"];
        assert_ne!(fresh, "y");
        assert!(g.producer(fresh).is_some());
        assert!(g.producer("y").is_none());
    }

    #[test]
    fn test_deprocessing_bgr_order() {
        let mut spec = image_spec(ColorSpace::Bgr);
        let mut args = ImageArgs::default();
        args.red_bias = Some(PerImage::All(1.0));
        args.blue_bias = Some(PerImage::All(3.0));
        args.image_scale = Some(PerImage::All(2.0));

        add_deprocessing(&mut spec, &args, "y_0", "y").unwrap();
        let layer = spec.layer("y_0").unwrap();
        assert_eq!(layer.outputs, vec!["y"]);
        match &layer.kind {
            LayerKind::Scale { scale, bias, .. } => {
                assert_eq!(scale.values, vec![2.0; 3]);
                assert_eq!(bias.as_ref().unwrap().values, vec![3.0, 0.0, 1.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deprocessing_grayscale() {
        let mut spec = image_spec(ColorSpace::Grayscale);
        let mut args = ImageArgs::default();
        args.gray_bias = Some(PerImage::All(0.5));
        add_deprocessing(&mut spec, &args, "y_0", "y").unwrap();
        match &spec.layer("y_0").unwrap().kind {
            LayerKind::Scale { bias, shape_bias, .. } => {
                assert_eq!(bias.as_ref().unwrap().values, vec![0.5]);
                assert_eq!(shape_bias, &vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_register_optionals() {
        let mut spec = image_spec(ColorSpace::Rgb);
        spec.description
            .inputs
            .push(FeatureDescription::new("h0", FeatureType::array(vec![8])));
        let mut g = scaler_graph(vec![0.0; 3]);
        g.optional_inputs.push(EdgeInfo::new("h0", 1, vec![8]));

        register_optionals(&mut spec, &g);
        let h0: Vec<_> = spec
            .description
            .inputs
            .iter()
            .filter(|f| f.name == "h0")
            .collect();
        assert_eq!(h0.len(), 1);
        assert!(h0[0].optional);
    }
}
