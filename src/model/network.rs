use std::{collections::HashMap, fs, path::Path};

use ndarray::IxDyn;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use tracing::debug;

use crate::{
    engine::{Device, EngineError, Op, Tensor, Trace, TracedNode},
    model::Model,
};

/// Sequential network built from a class definition.
#[derive(Debug, Clone)]
pub struct Network {
    class_name: String,
    layers: Vec<(String, Op)>,
    device: Device,
    training: bool,
}

impl Network {
    pub fn new(class_name: &str, ops: Vec<Op>) -> Self {
        Self {
            class_name: class_name.to_string(),
            layers: ops
                .into_iter()
                .enumerate()
                .map(|(idx, op)| (idx.to_string(), op))
                .collect(),
            device: Device::Cpu,
            training: true,
        }
    }

    pub fn state_dict_keys(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|(prefix, op)| {
                op.parameters()
                    .into_iter()
                    .map(move |(name, _)| format!("{prefix}.{name}"))
            })
            .collect()
    }
}

fn decode(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, EngineError> {
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        Dtype::F64 => Ok(bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect()),
        other => Err(EngineError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{other:?}"),
        }),
    }
}

impl Model for Network {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn load_state_dict(&mut self, weights: &Path) -> Result<(), EngineError> {
        let bytes = fs::read(weights).map_err(|source| EngineError::Io {
            path: weights.to_path_buf(),
            source,
        })?;
        let checkpoint =
            SafeTensors::deserialize(&bytes).map_err(|e| EngineError::Checkpoint(e.to_string()))?;

        let mut stored: HashMap<String, (Vec<usize>, Vec<f32>)> = HashMap::new();
        for (name, view) in checkpoint.tensors() {
            let data = decode(&name, &view)?;
            stored.insert(name, (view.shape().to_vec(), data));
        }

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for (prefix, op) in &self.layers {
            for (param, current) in op.parameters() {
                let key = format!("{prefix}.{param}");
                match stored.get(&key) {
                    None => missing.push(key),
                    Some((shape, _)) if shape.as_slice() != current.shape() => mismatched.push(
                        format!(
                            "size mismatch for {key}: copying a param with shape {shape:?} from checkpoint, \
                             the shape in current model is {:?}",
                            current.shape()
                        ),
                    ),
                    Some(_) => {}
                }
            }
        }
        let expected = self.state_dict_keys();
        let mut unexpected: Vec<&String> = stored
            .keys()
            .filter(|key| !expected.contains(*key) && !key.ends_with(".num_batches_tracked"))
            .collect();
        unexpected.sort();

        let mut problems = mismatched;
        if !missing.is_empty() {
            problems.push(format!("Missing key(s) in state_dict: {}", missing.join(", ")));
        }
        if !unexpected.is_empty() {
            let keys: Vec<&str> = unexpected.iter().map(|k| k.as_str()).collect();
            problems.push(format!("Unexpected key(s) in state_dict: {}", keys.join(", ")));
        }
        if !problems.is_empty() {
            return Err(EngineError::StateDict {
                class: self.class_name.clone(),
                problems,
            });
        }

        for (prefix, op) in &mut self.layers {
            for (param, current) in op.parameters_mut() {
                let key = format!("{prefix}.{param}");
                if let Some((shape, data)) = stored.remove(&key) {
                    *current = Tensor::from_shape_vec(IxDyn(&shape), data)
                        .map_err(|e| EngineError::Checkpoint(format!("{key}: {e}")))?;
                }
            }
        }
        debug!(class = %self.class_name, path = %weights.display(), "loaded state dict");
        Ok(())
    }

    fn supports_device(&self, device: Device) -> bool {
        device == Device::Cpu
    }

    fn to_device(&mut self, device: Device) -> Result<(), EngineError> {
        if !self.supports_device(device) {
            return Err(EngineError::UnsupportedDevice(device));
        }
        self.device = device;
        Ok(())
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn trace(&self, input: &Tensor) -> Result<Trace, EngineError> {
        let mut nodes = Vec::with_capacity(self.layers.len());
        let mut x = input.clone();
        for (name, op) in &self.layers {
            let y = op
                .forward(&x, self.training)
                .map_err(|reason| EngineError::Forward {
                    layer: format!("{name} ({})", op.kind()),
                    reason,
                })?;
            nodes.push(TracedNode {
                name: name.clone(),
                op: op.clone(),
                input_shape: x.shape().to_vec(),
                output_shape: y.shape().to_vec(),
            });
            x = y;
        }

        Ok(Trace {
            class_name: self.class_name.clone(),
            device: self.device,
            input_shape: input.shape().to_vec(),
            output_shape: x.shape().to_vec(),
            nodes,
            output: x,
        })
    }
}
