//! ONNX model loading
//!
//! # Example
//!
//! ```ignore
//! use onnx_coreml::io::{decode_model, load_model};
//!
//! let model = load_model("model.onnx")?;
//! println!("IR version: {}", model.ir_version);
//!
//! let bytes = std::fs::read("model.onnx")?;
//! let model = decode_model(&bytes)?;
//! ```

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use prost::Message;
use tracing::debug;

use crate::error::{ConvertError, ConvertResult};
use crate::proto::ModelProto;

/// Decode a serialized `ModelProto`
pub fn decode_model(bytes: &[u8]) -> ConvertResult<ModelProto> {
    let model = ModelProto::decode(bytes)?;
    if model.graph.is_none() {
        return Err(ConvertError::Structural("Model has no graph".to_string()));
    }
    Ok(model)
}

/// Read and decode a model file
pub fn load_model<P: AsRef<Path>>(path: P) -> ConvertResult<ModelProto> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    debug!(path = %path.display(), bytes = buffer.len(), "model file read");
    decode_model(&buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::extensions::{make_node, make_tensor_value_info};
    use crate::proto::{GraphProto, OperatorSetIdProto};

    fn model() -> ModelProto {
        ModelProto {
            ir_version: 4,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 9,
            }],
            graph: Some(GraphProto {
                node: vec![make_node("Relu", &["x"], &["y"], "relu")],
                input: vec![make_tensor_value_info("x", 1, &[1, 3])],
                output: vec![make_tensor_value_info("y", 1, &[1, 3])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        let bytes = model().encode_to_vec();
        let decoded = decode_model(&bytes).unwrap();
        assert_eq!(decoded.ir_version, 4);
        assert_eq!(decoded.graph.unwrap().node[0].op_type, "Relu");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_model(&[0xff, 0xff, 0xff]),
            Err(ConvertError::ProtoDecode(_))
        ));
    }

    #[test]
    fn test_graphless_model() {
        let bytes = ModelProto::default().encode_to_vec();
        assert!(matches!(decode_model(&bytes), Err(ConvertError::Structural(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_model("/nonexistent/model.onnx"),
            Err(ConvertError::Io(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join("onnx_coreml_io_test.onnx");
        std::fs::write(&path, model().encode_to_vec()).unwrap();
        let loaded = load_model(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.get_opset_version(), Some(9));
    }
}
