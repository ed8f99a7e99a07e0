use std::path::Path;

use ndarray::{Axis, IxDyn};
use tracing::debug;

use crate::{
    engine::{Op, Tensor, TracedNode},
    model::Model,
    onnx::{Dim, LoweringOptions, build_model, save_model, write_with_external_data},
};

use super::{ExportError, ExportStrategy};

const BATCH_AXIS: &str = "batch_size";

/// Tracing exporter with embedded parameters, opset 17 and constant folding.
#[derive(Debug, Clone)]
pub struct LegacyExporter {
    pub opset: i64,
    pub do_constant_folding: bool,
    pub use_external_data_format: bool,
    external_data_threshold: usize,
}

impl LegacyExporter {
    pub fn new(external_data_threshold: usize) -> Self {
        Self {
            opset: 17,
            do_constant_folding: true,
            use_external_data_format: true,
            external_data_threshold,
        }
    }
}

fn batch_axis(shape: &[usize]) -> Vec<Dim> {
    shape
        .iter()
        .enumerate()
        .map(|(axis, size)| match axis {
            0 => Dim::Symbolic(BATCH_AXIS.to_string()),
            _ => Dim::Fixed(*size),
        })
        .collect()
}

/// Folds batch norm into a preceding conv, returning the fused weight and bias.
fn fuse_conv_bn(conv: &Op, bn: &Op) -> Option<Op> {
    let (
        Op::Conv2d {
            weight,
            bias,
            stride,
            padding,
        },
        Op::BatchNorm2d {
            weight: gamma,
            bias: beta,
            running_mean,
            running_var,
            eps,
        },
    ) = (conv, bn)
    else {
        return None;
    };
    let channels = weight.shape()[0];
    if gamma.len() != channels {
        return None;
    }

    let scale: Vec<f32> = gamma
        .iter()
        .zip(running_var.iter())
        .map(|(g, v)| g / (v + eps).sqrt())
        .collect();
    let mut fused_weight = weight.clone();
    for (ch, mut filter) in fused_weight.axis_iter_mut(Axis(0)).enumerate() {
        filter.mapv_inplace(|w| w * scale[ch]);
    }
    let fused_bias: Vec<f32> = (0..channels)
        .map(|ch| {
            let b = bias.as_ref().map_or(0.0, |b| b[[ch]]);
            (b - running_mean[[ch]]) * scale[ch] + beta[[ch]]
        })
        .collect();

    Some(Op::Conv2d {
        weight: fused_weight,
        bias: Tensor::from_shape_vec(IxDyn(&[channels]), fused_bias).ok(),
        stride: *stride,
        padding: *padding,
    })
}

/// Drops no-op layers and fuses conv + batch norm pairs for inference.
pub fn fold_constants(nodes: &[TracedNode]) -> Vec<TracedNode> {
    let mut folded: Vec<TracedNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match &node.op {
            Op::Dropout { .. } | Op::Identity => continue,
            Op::BatchNorm2d { .. } => {
                if let Some(prev) = folded.last_mut() {
                    if let Some(fused) = fuse_conv_bn(&prev.op, &node.op) {
                        prev.op = fused;
                        prev.output_shape = node.output_shape.clone();
                        continue;
                    }
                }
                folded.push(node.clone());
            }
            _ => folded.push(node.clone()),
        }
    }
    folded
}

impl ExportStrategy for LegacyExporter {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn export(&self, model: &dyn Model, input: &Tensor, path: &Path) -> Result<(), ExportError> {
        let trace = model.trace(input)?;
        let nodes = if self.do_constant_folding {
            fold_constants(&trace.nodes)
        } else {
            trace.nodes.clone()
        };

        let options = LoweringOptions {
            opset: self.opset,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            input_dims: batch_axis(&trace.input_shape),
            output_dims: batch_axis(&trace.output_shape),
            debug_shapes: false,
            exporter: self.name().to_string(),
        };
        let onnx = build_model(&trace.class_name, &nodes, &options)?;
        if self.use_external_data_format {
            write_with_external_data(&onnx, path, self.external_data_threshold)?;
        } else {
            save_model(&onnx, path)?;
        }
        debug!(
            class = %trace.class_name,
            traced = trace.nodes.len(),
            lowered = nodes.len(),
            "legacy export written"
        );
        Ok(())
    }

    fn external_data_toggle(&mut self) -> Option<&mut bool> {
        Some(&mut self.use_external_data_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{DEFAULT_MAX_TENSOR_ELEMENTS, Device, random_input, replay},
        export::ExportPipeline,
        model::Network,
        onnx::{companion_path, load_model},
    };
    use approx::assert_abs_diff_eq;
    use tempfile::TempDir;

    fn conv_bn_network() -> Network {
        let channels = 3;
        let ramp = |offset: f32| {
            Tensor::from_shape_vec(
                IxDyn(&[channels]),
                (0..channels).map(|c| offset + c as f32 * 0.25).collect(),
            )
            .unwrap()
        };
        let mut net = Network::new(
            "ConvBn",
            vec![
                Op::conv2d(2, channels, 3, 1, 1, false).unwrap(),
                Op::BatchNorm2d {
                    weight: ramp(0.5),
                    bias: ramp(-0.2),
                    running_mean: ramp(0.1),
                    running_var: ramp(1.5),
                    eps: 1e-5,
                },
                Op::Dropout { p: 0.5 },
                Op::Relu,
                Op::Identity,
            ],
        );
        net.eval();
        net
    }

    #[test]
    fn folding_preserves_forward_result() {
        let net = conv_bn_network();
        let input = random_input(&[2, 2, 5, 5], Device::Cpu, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        let trace = net.trace(&input).unwrap();

        let folded = fold_constants(&trace.nodes);
        let kinds: Vec<_> = folded.iter().map(|n| n.op.kind()).collect();
        assert_eq!(kinds, vec!["conv2d", "relu"]);

        let replayed = replay(&folded, &input).unwrap();
        assert_eq!(replayed.shape(), trace.output.shape());
        for (a, b) in replayed.iter().zip(trace.output.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn batch_norm_without_conv_is_kept() {
        let mut net = Network::new("Bn", vec![Op::Relu, Op::batch_norm2d(2, 1e-5).unwrap()]);
        net.eval();
        let trace = net
            .trace(&random_input(&[1, 2, 2, 2], Device::Cpu, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap())
            .unwrap();
        assert_eq!(fold_constants(&trace.nodes).len(), 2);
    }

    #[test]
    fn names_inputs_and_batch_axis() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ConvBn.onnx");
        let net = conv_bn_network();
        let input = random_input(&[1, 2, 4, 4], Device::Cpu, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        LegacyExporter::new(usize::MAX)
            .export(&net, &input, &path)
            .unwrap();

        let model = load_model(&path).unwrap();
        let graph = model.graph.unwrap();
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Conv", "Relu"]);
        assert_eq!(graph.input[0].name, "input");
        assert_eq!(graph.output[0].name, "output");
        for info in [&graph.input[0], &graph.output[0]] {
            assert_eq!(
                info.dims()[0].value,
                Some(crate::onnx::proto::DimensionValue::DimParam(BATCH_AXIS.into()))
            );
        }
    }

    #[test]
    fn pipeline_switches_off_external_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ConvBn.onnx");
        let mut exporter = LegacyExporter::new(1);
        assert!(exporter.use_external_data_format);
        *exporter.external_data_toggle().unwrap() = false;
        let net = conv_bn_network();
        let input = random_input(&[1, 2, 4, 4], Device::Cpu, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        exporter.export(&net, &input, &path).unwrap();
        assert!(!companion_path(&path).exists());

        let report = ExportPipeline::new(vec![Box::new(LegacyExporter::new(1))])
            .run(&net, &input, &path)
            .unwrap();
        assert_eq!(report.normalization, crate::onnx::Normalization::Unchanged);
    }
}
