//! Target spec builder
//!
//! This module holds what lowering produces:
//!
//! - [`SpecBuilder`]: the layer-emission and description surface
//! - [`NeuralNetworkSpec`]: the in-memory target model implementing it
//! - [`layers`]: [`Layer`], [`LayerKind`] and the parameter types
//! - [`cleanup`]: passes over the finished layer list
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::builder::{cleanup, Activation, LayerKind, SpecBuilder};
//!
//! spec.emit("relu", &["x"], &["y"], LayerKind::Activation {
//!     activation: Activation::Relu,
//! })?;
//!
//! let stats = cleanup::cleanup_with_stats(&mut spec);
//! println!("Removed {} layers", stats.layers_removed);
//! println!("{}", spec.to_json_pretty()?);
//! ```

pub mod cleanup;
pub mod layers;
pub mod spec;

pub use cleanup::{
    cleanup_with_stats, collect_used_blobs, remove_disconnected_layers, transform_conv_crop,
    CleanupStats,
};
pub use layers::{
    Activation, BinaryOp, BorderMode, CompareOp, CustomParam, ElementwiseMode, Layer, LayerKind,
    LogicalOp, MathOp, PaddingMode, PoolingType, RecurrentActivation, RecurrentWeights,
    ReduceMode, ReduceOp, ReorganizeMode, ReshapeOrder, ResizeMode, SameAsymmetry, ScatterMode,
    SliceAxis, UnaryMode, UpsampleMode, WeightParams,
};
pub use spec::{
    target_label, ColorSpace, FeatureDescription, FeatureType, ImageArgs, ImageScaler,
    ModelDescription, NetworkKind, NeuralNetworkSpec, PerImage, SpecBuilder,
    IOS11_2_SPEC_VERSION, IOS12_SPEC_VERSION, IOS13_SPEC_VERSION,
};
