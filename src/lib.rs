//! # onnx-coreml
//!
//! ONNX to CoreML neural-network graph compiler.
//!
//! A decoded ONNX model is turned into an op graph, rewritten by a
//! fixpoint pipeline of folding, elimination and fusion passes, and then
//! lowered node by node into target layers.
//!
//! ## Features
//!
//! - **Two dialects**: rank-5 `[S, B, C, H, W]` layers driven by an axis
//!   map (targets `11.2`, `12`) and arbitrary-rank layers (target `13`)
//! - **Graph rewrites**: constant folding, Dropout/Cast/Pad elimination,
//!   Conv+Add and BatchNormalization fusion, rank-6 reshape rewrites
//! - **Escape hatch**: custom layers and per-node or per-op lowering overrides
//! - **Post-processing**: image inputs/outputs, classifier labels, optional
//!   recurrent state features
//!
//! ## Example
//!
//! ```ignore
//! use onnx_coreml::prelude::*;
//!
//! let model = load_model("model.onnx")?;
//! let output = convert(&model, &ConvertConfig::new(TargetVersion::Ios13))?;
//! println!("{}", output.spec.to_json_pretty()?);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

pub mod axis;
pub mod builder;
pub mod convert;
pub mod error;
pub mod graph;
pub mod io;
pub mod lowering;
pub mod proto;
pub mod tensor;
pub mod transformers;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Prelude module - import commonly used types with `use onnx_coreml::prelude::*`
pub mod prelude {
    pub use crate::builder::{LayerKind, NeuralNetworkSpec, SpecBuilder};
    pub use crate::convert::{
        convert, convert_file, convert_graph, ConvertConfig, ConvertOutput, TargetVersion,
    };
    pub use crate::error::{ConvertError, ConvertResult};
    pub use crate::graph::{Graph, Node};
    pub use crate::io::{decode_model, load_model};
    pub use crate::lowering::{CustomLowering, LoweringCx};
    pub use crate::proto::ModelProto;
    pub use crate::transformers::{GraphTransformer, TransformPipeline};
}

// ============================================================================
// Crate-level re-exports
// ============================================================================

pub use convert::{convert, ConvertConfig, ConvertOutput, TargetVersion};
pub use error::{ConvertError, ConvertResult};

// ============================================================================
// Version information
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lowest ONNX opset the lowering tables are written against
pub const SUPPORTED_OPSET_MIN: i64 = 7;
/// Highest ONNX opset the lowering tables are written against
pub const SUPPORTED_OPSET_MAX: i64 = 11;
