//! Extension methods for ONNX protobuf types
//!
//! Accessors used by graph construction, and constructors used to build
//! models by hand (tests, benches, synthetic graphs).

use super::onnx::*;

// ============================================================================
// ModelProto extensions
// ============================================================================

impl ModelProto {
    /// Get the opset version for the default domain
    pub fn get_opset_version(&self) -> Option<i64> {
        self.opset_import
            .iter()
            .find(|op| op.domain.is_empty() || op.domain == "ai.onnx")
            .map(|op| op.version)
    }
}

// ============================================================================
// ValueInfoProto extensions
// ============================================================================

impl ValueInfoProto {
    /// Shape dimensions, with `-1` for symbolic or missing dims
    pub fn get_shape(&self) -> Option<Vec<i64>> {
        self.tensor_type().and_then(|tensor| {
            tensor.shape.as_ref().map(|s| {
                s.dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(tensor_shape_proto::dimension::Value::DimValue(v)) => *v,
                        _ => -1,
                    })
                    .collect()
            })
        })
    }

    /// Element type if this is a tensor type
    pub fn get_elem_type(&self) -> Option<i32> {
        self.tensor_type().map(|tensor| tensor.elem_type)
    }

    fn tensor_type(&self) -> Option<&type_proto::Tensor> {
        self.r#type.as_ref().and_then(|t| match t.value.as_ref() {
            Some(type_proto::Value::TensorType(tensor)) => Some(tensor),
            None => None,
        })
    }
}

// ============================================================================
// AttributeProto constructors
// ============================================================================

impl AttributeProto {
    /// Integer attribute
    pub fn new_int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            i: value,
            r#type: attribute_proto::AttributeType::Int as i32,
            ..Default::default()
        }
    }

    /// Float attribute
    pub fn new_float(name: &str, value: f32) -> Self {
        Self {
            name: name.to_string(),
            f: value,
            r#type: attribute_proto::AttributeType::Float as i32,
            ..Default::default()
        }
    }

    /// String attribute
    pub fn new_string(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            s: value.as_bytes().to_vec(),
            r#type: attribute_proto::AttributeType::String as i32,
            ..Default::default()
        }
    }

    /// Ints attribute
    pub fn new_ints(name: &str, values: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            ints: values,
            r#type: attribute_proto::AttributeType::Ints as i32,
            ..Default::default()
        }
    }

    /// Floats attribute
    pub fn new_floats(name: &str, values: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            floats: values,
            r#type: attribute_proto::AttributeType::Floats as i32,
            ..Default::default()
        }
    }

    /// Tensor attribute
    pub fn new_tensor(name: &str, value: TensorProto) -> Self {
        Self {
            name: name.to_string(),
            t: Some(value),
            r#type: attribute_proto::AttributeType::Tensor as i32,
            ..Default::default()
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Create a ValueInfoProto for a tensor; negative dims become symbolic
pub fn make_tensor_value_info(name: &str, elem_type: i32, shape: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type,
                shape: Some(TensorShapeProto {
                    dim: shape
                        .iter()
                        .map(|&d| tensor_shape_proto::Dimension {
                            value: Some(if d >= 0 {
                                tensor_shape_proto::dimension::Value::DimValue(d)
                            } else {
                                tensor_shape_proto::dimension::Value::DimParam("N".to_string())
                            }),
                            denotation: String::new(),
                        })
                        .collect(),
                }),
            })),
            denotation: String::new(),
        }),
        doc_string: String::new(),
    }
}

/// Create a NodeProto
pub fn make_node(op_type: &str, inputs: &[&str], outputs: &[&str], name: &str) -> NodeProto {
    NodeProto {
        op_type: op_type.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        name: name.to_string(),
        ..Default::default()
    }
}

/// Create a FLOAT initializer
pub fn make_tensor_f32(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: tensor_proto::DataType::Float as i32,
        float_data: data,
        name: name.to_string(),
        ..Default::default()
    }
}

/// Create an INT64 initializer
pub fn make_tensor_i64(name: &str, dims: &[i64], data: Vec<i64>) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: tensor_proto::DataType::Int64 as i32,
        int64_data: data,
        name: name.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_tensor_value_info() {
        let vi = make_tensor_value_info("test", 1, &[1, 3, 224, 224]);
        assert_eq!(vi.name, "test");
        assert_eq!(vi.get_shape(), Some(vec![1, 3, 224, 224]));
        assert_eq!(vi.get_elem_type(), Some(1));
    }

    #[test]
    fn test_symbolic_dim() {
        let vi = make_tensor_value_info("x", 1, &[-1, 16]);
        assert_eq!(vi.get_shape(), Some(vec![-1, 16]));
    }

    #[test]
    fn test_make_node() {
        let node = make_node("Conv", &["X", "W"], &["Y"], "conv_0");
        assert_eq!(node.op_type, "Conv");
        assert_eq!(node.input, vec!["X", "W"]);
        assert_eq!(node.output, vec!["Y"]);
    }

    #[test]
    fn test_make_tensor_i64() {
        let t = make_tensor_i64("shape", &[2], vec![0, -1]);
        assert_eq!(t.dims, vec![2]);
        assert_eq!(t.int64_data, vec![0, -1]);
    }
}
