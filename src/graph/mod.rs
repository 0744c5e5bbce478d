//! Op graph intermediate representation
//!
//! - [`Graph`]: node arena plus edge-keyed side tables
//! - [`Node`] / [`NodeId`]: ops and their stable arena index
//! - [`Attributes`] / [`AttrValue`]: decoded ONNX attributes
//! - [`maps`]: producer/consumer index types and builders
//!
//! # Lifecycle
//!
//! A graph is built once from the decoded source ([`Graph::from_onnx`]).
//! Each pass returns a new graph value; within a pass nodes may be edited in
//! place, after which [`Graph::rebuild`] recomputes adjacency from edge
//! names. Adjacency is stored as [`NodeId`] sets, so rewiring is index
//! editing and parent/child links are always mutual after a rebuild.
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::graph::Graph;
//!
//! let graph = Graph::from_onnx(&model.graph.unwrap())?;
//! for node in graph.nodes() {
//!     println!("{} ({})", node.name, node.op_type);
//! }
//! ```

pub mod attrs;
pub mod construct;
pub mod ir;
pub mod maps;
pub mod mutators;
pub mod node;

pub use attrs::{AttrValue, Attributes};
pub use ir::{EdgeInfo, Graph};
pub use maps::{BlobFromOpType, BlobToOpType, ConsumerMap, ProducerMap, ShapeDict};
pub use node::{Node, NodeId, NodeIds};
