//! Host tensor engine behind the model capability.
//!
//! Models run their forward pass through [`Op`] kernels and hand exporters a
//! [`Trace`]; nothing outside this module touches the kernels directly.

mod ops;
mod trace;

use std::{fmt, path::PathBuf};

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Serialize;
use thiserror::Error;

pub use ops::{Op, Pool2d};
pub use trace::{Trace, TracedNode, replay};

pub type Tensor = ArrayD<f32>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to read weights {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),
    #[error("unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("Error(s) in loading state_dict for {class}: {}", .problems.join("; "))]
    StateDict { class: String, problems: Vec<String> },
    #[error("device {0} is not supported by this model")]
    UnsupportedDevice(Device),
    #[error("forward pass failed in {layer}: {reason}")]
    Forward { layer: String, reason: String },
    #[error("tensor of shape {shape:?} exceeds the limit of {limit} elements")]
    TooLarge { shape: Vec<usize>, limit: usize },
    #[error("unable to allocate {numel} elements for tensor of shape {shape:?}")]
    Allocation { shape: Vec<usize>, numel: usize },
}

/// Upper bound on elements in any tensor sized by a request (1 GiB of f32).
pub const DEFAULT_MAX_TENSOR_ELEMENTS: usize = 1 << 28;

/// Element count of `shape`, rejected when it overflows or exceeds `limit`.
pub fn checked_numel(shape: &[usize], limit: usize) -> Result<usize, EngineError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .filter(|numel| *numel <= limit)
        .ok_or_else(|| EngineError::TooLarge {
            shape: shape.to_vec(),
            limit,
        })
}

/// Empty buffer with room for `numel` floats; a refused reservation is an error, not an abort.
pub(crate) fn try_buffer(shape: &[usize], numel: usize) -> Result<Vec<f32>, EngineError> {
    let mut data = Vec::new();
    data.try_reserve_exact(numel)
        .map_err(|_| EngineError::Allocation {
            shape: shape.to_vec(),
            numel,
        })?;
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Requested placement; `Auto` prefers the first GPU when the model can run there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Auto,
    Exact(Device),
}

impl DeviceRequest {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower == "cpu" {
            DeviceRequest::Exact(Device::Cpu)
        } else if lower.starts_with("cuda") {
            let idx = lower
                .split(':')
                .nth(1)
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0);
            DeviceRequest::Exact(Device::Cuda(idx))
        } else {
            DeviceRequest::Auto
        }
    }

    pub fn resolve(self, supports: impl Fn(Device) -> bool) -> Result<Device, EngineError> {
        match self {
            DeviceRequest::Auto => Ok([Device::Cuda(0), Device::Cpu]
                .into_iter()
                .find(|d| supports(*d))
                .unwrap_or(Device::Cpu)),
            DeviceRequest::Exact(device) if supports(device) => Ok(device),
            DeviceRequest::Exact(device) => Err(EngineError::UnsupportedDevice(device)),
        }
    }
}

/// Standard-normal tensor of `shape`, allocated for `device`.
pub fn random_input(shape: &[usize], device: Device, limit: usize) -> Result<Tensor, EngineError> {
    if device != Device::Cpu {
        return Err(EngineError::UnsupportedDevice(device));
    }
    let numel = checked_numel(shape, limit)?;
    let mut data = try_buffer(shape, numel)?;
    let mut rng = rand::rng();
    data.extend((0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)));
    Tensor::from_shape_vec(IxDyn(shape), data).map_err(|e| EngineError::Forward {
        layer: "input".into(),
        reason: e.to_string(),
    })
}
