//! Error types for onnx-coreml
//!
//! Every fallible operation in the crate returns [`ConvertResult`]. The
//! variants mirror the failure classes a compile can hit: malformed IR,
//! ops with no lowering, ops whose attributes fall outside the supported
//! cases, constants that must be known but are not, and features that the
//! configured target cannot express.

use thiserror::Error;

/// Hint appended to unsupported-op failures under the legacy dialect
pub const RAISE_TARGET_HINT: &str =
    "Please try converting again with target \"13\" or supply a custom conversion function";

/// Hint appended to unsupported-op failures under the ND dialect
pub const CUSTOM_FUNCTION_HINT: &str =
    "Please supply a custom conversion function or enable custom layers";

/// Main error type for graph compilation
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Malformed IR (duplicate producer, dangling edge, ...)
    #[error("Structural error: {0}")]
    Structural(String),

    /// No lowering entry exists for the op type
    #[error("Unsupported ONNX ops of type: {op_types}. {hint}")]
    UnsupportedOp {
        /// Comma separated list of offending op types
        op_types: String,
        /// First offending node, if the failure concerns a single node
        node: Option<String>,
        /// Suggestion for the caller
        hint: String,
    },

    /// A lowering entry exists but this node's configuration is outside its cases
    #[error("Error while converting op of type: {op_type}. Error message: {reason} (node: {node})")]
    UnsupportedConfiguration {
        /// Op type of the node
        op_type: String,
        /// Node name
        node: String,
        /// What was rejected
        reason: String,
    },

    /// A lowering requires a constant that is not available
    #[error("Missing initializer for node {node}: {message}")]
    MissingInitializer {
        /// Node name
        node: String,
        /// What was missing
        message: String,
    },

    /// Feature unavailable at the configured target level
    #[error("{feature} not supported with target iOS {target}, please provide a higher target")]
    SpecCapability {
        /// Layer or feature name
        feature: String,
        /// Configured target
        target: String,
    },

    /// Element type the target description cannot carry
    #[error("Invalid data type: {0}")]
    InvalidDataType(i32),

    /// Bad compile configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// JSON configuration error
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Unsupported configuration for a specific node
    pub fn config(op_type: &str, node: &str, reason: impl Into<String>) -> Self {
        ConvertError::UnsupportedConfiguration {
            op_type: op_type.to_string(),
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the escape hatch may absorb this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConvertError::UnsupportedOp { .. } | ConvertError::UnsupportedConfiguration { .. }
        )
    }
}

/// Result type alias for compile operations
pub type ConvertResult<T> = Result<T, ConvertError>;
