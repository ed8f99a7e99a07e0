//! ONNX model files: protobuf schema, lowering from traces, external data and checks.

pub mod builder;
pub mod checker;
pub mod external;
pub mod proto;

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use prost::Message;
use thiserror::Error;

pub use builder::{Dim, LoweringOptions, build_model};
pub use checker::{ValidationError, check_model, check_model_file};
pub use external::{Normalization, ensure_single_file, write_with_external_data};
pub use proto::ModelProto;

#[derive(Debug, Error)]
pub enum OnnxError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a valid ONNX model: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },
    #[error("cannot lower {layer}: {reason}")]
    Lowering { layer: String, reason: String },
    #[error("external data for '{tensor}': {reason}")]
    ExternalData { tensor: String, reason: String },
}

impl OnnxError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        OnnxError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn load_model(path: &Path) -> Result<ModelProto, OnnxError> {
    let bytes = fs::read(path).map_err(|e| OnnxError::io(path, e))?;
    ModelProto::decode(bytes.as_slice()).map_err(|source| OnnxError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_model(model: &ModelProto, path: &Path) -> Result<(), OnnxError> {
    fs::write(path, model.encode_to_vec()).map_err(|e| OnnxError::io(path, e))
}

/// Side-car data file written next to `path` (`<file>.data`).
pub fn companion_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("model.onnx"));
    name.push(".data");
    path.with_file_name(name)
}
