//! Node attributes
//!
//! ONNX attributes decoded into a small closed value type. Lookups are by
//! name; insertion order is kept so that opaque attributes forwarded to a
//! custom layer come out in source order.

use indexmap::IndexMap;

use crate::error::ConvertResult;
use crate::proto::attribute_proto::AttributeType;
use crate::proto::AttributeProto;
use crate::tensor::{tensor_from_proto, Tensor};

/// A single attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// INT
    Int(i64),
    /// FLOAT
    Float(f32),
    /// STRING (decoded as UTF-8, lossy)
    String(String),
    /// TENSOR
    Tensor(Tensor),
    /// INTS
    Ints(Vec<i64>),
    /// FLOATS
    Floats(Vec<f32>),
    /// STRINGS
    Strings(Vec<String>),
}

impl AttrValue {
    /// Decode an AttributeProto. Graph-valued attributes yield `None`.
    pub fn from_proto(attr: &AttributeProto) -> ConvertResult<Option<Self>> {
        let kind = AttributeType::try_from(attr.r#type).unwrap_or(AttributeType::Undefined);
        let value = match kind {
            AttributeType::Int => AttrValue::Int(attr.i),
            AttributeType::Float => AttrValue::Float(attr.f),
            AttributeType::String => AttrValue::String(String::from_utf8_lossy(&attr.s).into()),
            AttributeType::Tensor => match &attr.t {
                Some(t) => AttrValue::Tensor(tensor_from_proto(t)?),
                None => return Ok(None),
            },
            AttributeType::Ints => AttrValue::Ints(attr.ints.clone()),
            AttributeType::Floats => AttrValue::Floats(attr.floats.clone()),
            AttributeType::Strings => AttrValue::Strings(
                attr.strings
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect(),
            ),
            // Untyped attributes from old exporters: infer from populated fields
            AttributeType::Undefined => {
                if !attr.ints.is_empty() {
                    AttrValue::Ints(attr.ints.clone())
                } else if !attr.floats.is_empty() {
                    AttrValue::Floats(attr.floats.clone())
                } else if !attr.s.is_empty() {
                    AttrValue::String(String::from_utf8_lossy(&attr.s).into())
                } else if attr.f != 0.0 {
                    AttrValue::Float(attr.f)
                } else {
                    AttrValue::Int(attr.i)
                }
            }
            AttributeType::Graph
            | AttributeType::Graphs
            | AttributeType::Tensors => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Integer view; floats are truncated
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Float view; ints are widened
    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }
}

/// Ordered attribute map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(IndexMap<String, AttrValue>);

impl Attributes {
    /// Empty attribute map
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode all attributes of a node
    pub fn from_protos(attrs: &[AttributeProto]) -> ConvertResult<Self> {
        let mut map = IndexMap::with_capacity(attrs.len());
        for attr in attrs {
            if let Some(value) = AttrValue::from_proto(attr)? {
                map.insert(attr.name.clone(), value);
            }
        }
        Ok(Self(map))
    }

    /// Raw lookup
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    /// Whether the attribute is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or replace
    pub fn insert(&mut self, key: impl Into<String>, value: AttrValue) {
        self.0.insert(key.into(), value);
    }

    /// Remove an attribute, keeping the order of the rest
    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.0.shift_remove(key)
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no attributes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in source order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    // ========================================================================
    // Typed getters
    // ========================================================================

    /// Integer attribute
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_int)
    }

    /// Integer attribute with a default
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.int(key).unwrap_or(default)
    }

    /// Float attribute
    pub fn float(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(AttrValue::as_float)
    }

    /// Float attribute with a default
    pub fn float_or(&self, key: &str, default: f32) -> f32 {
        self.float(key).unwrap_or(default)
    }

    /// String attribute
    pub fn string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(AttrValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// String attribute with a default
    pub fn string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.string(key).unwrap_or(default)
    }

    /// Integer list attribute. A scalar INT reads as a one-element list.
    pub fn ints(&self, key: &str) -> Option<Vec<i64>> {
        match self.get(key) {
            Some(AttrValue::Ints(v)) => Some(v.clone()),
            Some(AttrValue::Int(v)) => Some(vec![*v]),
            _ => None,
        }
    }

    /// Float list attribute. A scalar FLOAT reads as a one-element list.
    pub fn floats(&self, key: &str) -> Option<Vec<f32>> {
        match self.get(key) {
            Some(AttrValue::Floats(v)) => Some(v.clone()),
            Some(AttrValue::Float(v)) => Some(vec![*v]),
            Some(AttrValue::Ints(v)) => Some(v.iter().map(|&x| x as f32).collect()),
            _ => None,
        }
    }

    /// String list attribute
    pub fn strings(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(AttrValue::Strings(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Tensor attribute
    pub fn tensor(&self, key: &str) -> Option<&Tensor> {
        match self.get(key) {
            Some(AttrValue::Tensor(t)) => Some(t),
            _ => None,
        }
    }
}

impl FromIterator<(String, AttrValue)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, AttrValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
