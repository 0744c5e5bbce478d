//! Compile entry point
//!
//! [`convert`] runs the whole compile:
//!
//! 1. build the [`Graph`] and run the [`TransformPipeline`] to its fixpoint
//! 2. fold `ImageScaler` nodes into input preprocessing
//! 3. declare the model interface (and seed the axis map for the legacy dialect)
//! 4. reject unsupported op types up front unless custom layers are enabled
//! 5. lower every node, then attach deprocessing, labels and optional features
//! 6. drop disconnected layers and check the target can carry what was emitted
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::convert::{convert, ConvertConfig, TargetVersion};
//! use onnx_coreml::io::load_model;
//!
//! let model = load_model("model.onnx")?;
//! let output = convert(&model, &ConvertConfig::new(TargetVersion::Ios13))?;
//! println!("{}", output.spec.to_json_pretty()?);
//! for node in &output.custom_layer_nodes {
//!     println!("custom layer: {}", node);
//! }
//! ```

pub mod config;
pub mod features;
pub mod postprocess;

pub use config::{ClassLabels, ConvertConfig, TargetVersion};

use std::path::Path;

use tracing::{debug, info, warn};

use crate::builder::{cleanup_with_stats, CleanupStats, NeuralNetworkSpec, SpecBuilder};
use crate::error::ConvertResult;
use crate::graph::Graph;
use crate::io::load_model;
use crate::lowering::{
    check_unsupported_ops, lower_graph, CustomLayerNode, Dialect, ErrorHandler, LoweringCx,
};
use crate::proto::ModelProto;
use crate::transformers::{
    EliminateImageScaler, GraphTransformer, PipelineReport, TransformPipeline,
};
use crate::{SUPPORTED_OPSET_MAX, SUPPORTED_OPSET_MIN};

/// Statistics of one compile
#[derive(Debug, Clone)]
pub struct ConvertReport {
    /// Lowering dialect used
    pub dialect: Dialect,
    /// Nodes in the decoded graph
    pub source_nodes: usize,
    /// Nodes left after the transform pipeline
    pub lowered_nodes: usize,
    /// Transform pipeline outcome
    pub transform: PipelineReport,
    /// Layers in the finished spec
    pub layers: usize,
    /// Cleanup outcome
    pub cleanup: CleanupStats,
}

/// Result of a compile
#[derive(Debug, Clone)]
pub struct ConvertOutput {
    /// The target model
    pub spec: NeuralNetworkSpec,
    /// Nodes emitted as custom layers, with their shapes when known
    pub custom_layer_nodes: Vec<CustomLayerNode>,
    pub report: ConvertReport,
}

/// Compile a decoded model
pub fn convert(model: &ModelProto, config: &ConvertConfig) -> ConvertResult<ConvertOutput> {
    if let Some(opset) = model.get_opset_version() {
        if !(SUPPORTED_OPSET_MIN..=SUPPORTED_OPSET_MAX).contains(&opset) {
            warn!(opset, "model opset is outside the range the lowering tables target");
        }
    }
    let graph = Graph::from_model(model)?;
    convert_graph(graph, config)
}

/// Load and compile a model file
pub fn convert_file<P: AsRef<Path>>(path: P, config: &ConvertConfig) -> ConvertResult<ConvertOutput> {
    let model = load_model(path)?;
    convert(&model, config)
}

/// Compile an already built graph
pub fn convert_graph(mut graph: Graph, config: &ConvertConfig) -> ConvertResult<ConvertOutput> {
    config.validate()?;
    let dialect = config.target.dialect();
    let source_nodes = graph.len();
    debug!(target = %config.target, ?dialect, nodes = source_nodes, "compile start");

    // ========================================================================
    // Graph rewrites
    // ========================================================================

    let transform = TransformPipeline::standard(dialect == Dialect::Legacy).run(&mut graph)?;

    let mut preprocessing = config.preprocessing.clone();
    let mut image_input_names = config.image_input_names.clone();
    if preprocessing.is_empty() {
        postprocess::extract_image_scalers(&graph, &mut preprocessing, &mut image_input_names);
    }
    EliminateImageScaler::new().transform(&mut graph)?;

    // ========================================================================
    // Interface
    // ========================================================================

    let inputs = features::input_features(&mut graph, dialect, &config.input_axis_map)?;
    let outputs = features::output_features(
        &graph,
        dialect,
        !config.image_output_names.is_empty(),
    )?;
    let output_names: Vec<String> = outputs.iter().map(|f| f.name.clone()).collect();
    let mut spec = NeuralNetworkSpec::new(inputs, outputs, config.mode, config.target.spec_version());

    let deprocess = postprocess::needs_deprocessing(&config.image_output_names, &config.deprocessing);
    let renamed = if deprocess {
        postprocess::rename_outputs(&mut graph)?
    } else {
        Default::default()
    };

    if !image_input_names.is_empty() {
        spec.set_pre_processing_parameters(&image_input_names, &preprocessing)?;
    }
    for name in &config.image_output_names {
        spec.convert_output_to_image(name, config.deprocessing.bgr(name))?;
    }

    // ========================================================================
    // Lowering
    // ========================================================================

    if !config.add_custom_layers {
        check_unsupported_ops(graph.nodes(), config.overrides(), dialect)?;
    }
    let lowered_nodes = graph.len();
    let mut err = ErrorHandler::new(config.add_custom_layers, dialect);
    {
        let mut cx = LoweringCx::new(&mut spec, &mut graph, &mut err);
        lower_graph(&mut cx, config.overrides(), dialect)?;
    }
    if dialect == Dialect::Legacy {
        graph.axis_map.verify_ranks(&graph.shape_dict)?;
    }

    // ========================================================================
    // Post-processing
    // ========================================================================

    if deprocess {
        for name in output_names
            .iter()
            .filter(|n| config.image_output_names.contains(n))
        {
            if let Some(source) = renamed.get(name) {
                postprocess::add_deprocessing(&mut spec, &config.deprocessing, source, name)?;
            }
        }
    }

    if let Some(labels) = &config.class_labels {
        spec.set_class_labels(labels.load()?, &config.predicted_feature_name, None)?;
    }

    if dialect == Dialect::Legacy {
        features::describe_rank5(&mut spec, &graph)?;
    }
    postprocess::register_optionals(&mut spec, &graph);

    spec.check_capability()?;
    let cleanup = cleanup_with_stats(&mut spec);

    let report = ConvertReport {
        dialect,
        source_nodes,
        lowered_nodes,
        transform,
        layers: spec.layers().len(),
        cleanup,
    };
    info!(
        target = %config.target,
        nodes = report.lowered_nodes,
        rounds = report.transform.rounds,
        layers = report.layers,
        removed = report.cleanup.layers_removed,
        custom_layers = err.custom_layer_nodes.len(),
        "compile finished"
    );

    Ok(ConvertOutput {
        spec,
        custom_layer_nodes: err.custom_layer_nodes,
        report,
    })
}
