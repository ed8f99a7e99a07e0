use super::{Device, EngineError, Op, Tensor};

#[derive(Debug, Clone)]
pub struct TracedNode {
    /// State-dict prefix of the layer (`"0"`, `"1"`, ...).
    pub name: String,
    pub op: Op,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
}

/// Record of one forward pass: every executed layer with its parameters and shapes.
#[derive(Debug, Clone)]
pub struct Trace {
    pub class_name: String,
    pub device: Device,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub nodes: Vec<TracedNode>,
    pub output: Tensor,
}

/// Re-runs traced nodes in evaluation mode.
pub fn replay(nodes: &[TracedNode], input: &Tensor) -> Result<Tensor, EngineError> {
    nodes.iter().try_fold(input.clone(), |x, node| {
        node.op
            .forward(&x, false)
            .map_err(|reason| EngineError::Forward {
                layer: node.name.clone(),
                reason,
            })
    })
}
