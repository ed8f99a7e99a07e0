use std::{collections::HashSet, fs, path::Path};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

use super::{
    OnnxError, load_model,
    proto::{ModelProto, data_type},
};

const MAX_MODEL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

static KNOWN_OPS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "Add",
        "AveragePool",
        "BatchNormalization",
        "Constant",
        "Conv",
        "Dropout",
        "Flatten",
        "Gemm",
        "GlobalAveragePool",
        "Identity",
        "LeakyRelu",
        "MatMul",
        "MaxPool",
        "Mul",
        "Relu",
        "Reshape",
        "Sigmoid",
        "Softmax",
        "Tanh",
        "Transpose",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Load(#[from] OnnxError),
    #[error("model file is {bytes} bytes, above the 2GiB protobuf limit")]
    TooLarge { bytes: u64 },
    #[error("model has no IR version")]
    MissingIrVersion,
    #[error("model does not import the default operator set")]
    MissingOpset,
    #[error("model has no graph")]
    MissingGraph,
    #[error("graph has no {0}")]
    EmptySignature(&'static str),
    #[error("node '{node}' uses unknown operator '{op_type}'")]
    UnknownOperator { node: String, op_type: String },
    #[error("node '{node}' input '{input}' is not defined before use")]
    UndefinedInput { node: String, input: String },
    #[error("value '{0}' is produced more than once")]
    DuplicateOutput(String),
    #[error("graph output '{0}' is not produced by any node")]
    UnproducedOutput(String),
    #[error("initializer '{0}' has no data type")]
    UntypedInitializer(String),
    #[error("initializer '{0}' references external data")]
    ExternalData(String),
    #[error("initializer '{name}' holds {actual} bytes, expected {expected}")]
    InitializerSize {
        name: String,
        expected: usize,
        actual: usize,
    },
}

pub fn check_model(model: &ModelProto) -> Result<(), ValidationError> {
    if model.ir_version <= 0 {
        return Err(ValidationError::MissingIrVersion);
    }
    if !model
        .opset_import
        .iter()
        .any(|o| (o.domain.is_empty() || o.domain == "ai.onnx") && o.version > 0)
    {
        return Err(ValidationError::MissingOpset);
    }
    let graph = model.graph.as_ref().ok_or(ValidationError::MissingGraph)?;
    if graph.input.is_empty() {
        return Err(ValidationError::EmptySignature("inputs"));
    }
    if graph.output.is_empty() {
        return Err(ValidationError::EmptySignature("outputs"));
    }

    for tensor in &graph.initializer {
        if tensor.is_external() {
            return Err(ValidationError::ExternalData(tensor.name.clone()));
        }
        let element_size = data_type::element_size(tensor.data_type)
            .ok_or_else(|| ValidationError::UntypedInitializer(tensor.name.clone()))?;
        let expected = tensor.numel().max(0) as usize * element_size;
        let actual = tensor.stored_bytes();
        if expected != actual {
            return Err(ValidationError::InitializerSize {
                name: tensor.name.clone(),
                expected,
                actual,
            });
        }
    }

    let mut defined: HashSet<&str> = graph
        .input
        .iter()
        .map(|v| v.name.as_str())
        .chain(graph.initializer.iter().map(|t| t.name.as_str()))
        .collect();
    let mut produced: HashSet<&str> = HashSet::new();
    for node in &graph.node {
        if !KNOWN_OPS.contains(node.op_type.as_str()) {
            return Err(ValidationError::UnknownOperator {
                node: node.name.clone(),
                op_type: node.op_type.clone(),
            });
        }
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(ValidationError::UndefinedInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
        }
        for output in &node.output {
            if !produced.insert(output.as_str()) {
                return Err(ValidationError::DuplicateOutput(output.clone()));
            }
            defined.insert(output.as_str());
        }
    }

    for output in &graph.output {
        if !produced.contains(output.name.as_str()) {
            return Err(ValidationError::UnproducedOutput(output.name.clone()));
        }
    }
    Ok(())
}

/// Loads and checks a model file, including its on-disk size.
pub fn check_model_file(path: &Path) -> Result<(), ValidationError> {
    let bytes = fs::metadata(path)
        .map_err(|e| OnnxError::io(path, e))?
        .len();
    if bytes >= MAX_MODEL_BYTES {
        return Err(ValidationError::TooLarge { bytes });
    }
    let model = load_model(path)?;
    check_model(&model)?;
    debug!(path = %path.display(), bytes, "model passed checks");
    Ok(())
}
