//! Canonical axis bookkeeping for the legacy (rank-5) target layout
//!
//! The legacy target lays every blob out as `[Sequence, Batch, Channel,
//! Height, Width]`. For each edge the compiler records which of those five
//! slots each ONNX dimension occupies. The table is filled one edge at a
//! time as lowering runs and is append-only for the whole compile.
//!
//! - [`init`]: mapping of declared model inputs
//! - [`rules`]: per-op propagation and layout tables

pub mod init;
pub mod rules;

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

use crate::error::{ConvertError, ConvertResult};
use crate::graph::ShapeDict;

pub use init::{input_layout, InputLayout};

/// One of the five canonical slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// Sequence (S)
    Sequence = 0,
    /// Batch (B)
    Batch = 1,
    /// Channel (C)
    Channel = 2,
    /// Height (H)
    Height = 3,
    /// Width (W)
    Width = 4,
}

impl Axis {
    /// All slots in canonical order
    pub const ALL: [Axis; 5] = [
        Axis::Sequence,
        Axis::Batch,
        Axis::Channel,
        Axis::Height,
        Axis::Width,
    ];

    /// Slot index, `0..5`
    pub fn index(self) -> usize {
        self as usize
    }

    /// Slot for an index, `None` outside `0..5`
    pub fn from_index(index: i64) -> Option<Axis> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Single-letter name used by reduction axis strings
    pub fn letter(self) -> char {
        match self {
            Axis::Sequence => 'S',
            Axis::Batch => 'B',
            Axis::Channel => 'C',
            Axis::Height => 'H',
            Axis::Width => 'W',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Slot assignment for one edge, one entry per ONNX dimension
pub type AxisMapping = SmallVec<[Axis; 5]>;

/// Build a mapping from slot indices. Out-of-range indices are an error.
pub fn mapping_from_indices(indices: &[i64]) -> ConvertResult<AxisMapping> {
    indices
        .iter()
        .map(|&i| {
            Axis::from_index(i).ok_or_else(|| {
                ConvertError::InvalidConfig(format!("axis index {} is outside 0..5", i))
            })
        })
        .collect()
}

/// A layout combination the legacy target cannot express
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Unmappable(pub String);

impl Unmappable {
    /// Create from a reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Result of a layout rule
pub type AxisResult<T> = Result<T, Unmappable>;

/// Edge name → slot assignment
#[derive(Debug, Clone, Default)]
pub struct AxisMap {
    entries: FxHashMap<String, AxisMapping>,
}

impl AxisMap {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping of an edge, if determined
    pub fn get(&self, edge: &str) -> Option<&[Axis]> {
        self.entries.get(edge).map(|m| m.as_slice())
    }

    /// Whether the edge has a mapping
    pub fn contains(&self, edge: &str) -> bool {
        self.entries.contains_key(edge)
    }

    /// Record a mapping
    ///
    /// The first write wins; later writes for the same edge are ignored.
    /// Returns whether the entry was added.
    pub fn insert(&mut self, edge: &str, mapping: AxisMapping) -> bool {
        match self.entries.get(edge) {
            Some(existing) => {
                if *existing != mapping {
                    debug!(edge, ?existing, ignored = ?mapping, "axis map entry already set");
                }
                false
            }
            None => {
                self.entries.insert(edge.to_string(), mapping);
                true
            }
        }
    }

    /// Number of mapped edges
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is mapped yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Axis])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Check that every mapped edge with a known non-scalar shape has one
    /// slot per dimension
    pub fn verify_ranks(&self, shape_dict: &ShapeDict) -> ConvertResult<()> {
        for (edge, mapping) in &self.entries {
            if let Some(shape) = shape_dict.get(edge) {
                if !shape.is_empty() && shape.len() != mapping.len() {
                    return Err(ConvertError::Structural(format!(
                        "axis map of '{}' has {} entries but the edge has rank {}",
                        edge,
                        mapping.len(),
                        shape.len()
                    )));
                }
            }
        }
        Ok(())
    }
}
