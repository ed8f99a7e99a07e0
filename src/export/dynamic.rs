use std::path::Path;

use tracing::debug;

use crate::{
    engine::{Op, Tensor},
    model::Model,
    onnx::{Dim, LoweringOptions, build_model, write_with_external_data},
};

use super::{ExportError, ExportStrategy};

/// Modern exporter: every input axis symbolic, opset 18, no constant folding.
///
/// Large initializers always go to the companion data file.
#[derive(Debug, Clone)]
pub struct DynamicShapeExporter {
    pub opset: i64,
    pub op_level_debug: bool,
    external_data_threshold: usize,
}

impl DynamicShapeExporter {
    pub fn new(external_data_threshold: usize) -> Self {
        Self {
            opset: 18,
            op_level_debug: false,
            external_data_threshold,
        }
    }
}

impl ExportStrategy for DynamicShapeExporter {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn export(&self, model: &dyn Model, input: &Tensor, path: &Path) -> Result<(), ExportError> {
        let trace = model.trace(input)?;
        if let Some(node) = trace
            .nodes
            .iter()
            .find(|n| matches!(n.op, Op::Reshape { .. }))
        {
            return Err(ExportError::Unsupported {
                strategy: self.name(),
                reason: format!(
                    "data-dependent {} in layer {} under dynamic shapes",
                    node.op.kind(),
                    node.name
                ),
            });
        }

        let symbols: Vec<Dim> = (0..trace.input_shape.len())
            .map(|axis| Dim::Symbolic(format!("s{axis}")))
            .collect();
        let output_dims = trace
            .output_shape
            .iter()
            .enumerate()
            .map(|(axis, size)| match axis {
                0 => Dim::Symbolic("s0".to_string()),
                _ => Dim::Fixed(*size),
            })
            .collect();
        let options = LoweringOptions {
            opset: self.opset,
            input_name: "x".to_string(),
            output_name: "output_0".to_string(),
            input_dims: symbols,
            output_dims,
            debug_shapes: self.op_level_debug,
            exporter: self.name().to_string(),
        };

        let onnx = build_model(&trace.class_name, &trace.nodes, &options)?;
        let external = write_with_external_data(&onnx, path, self.external_data_threshold)?;
        debug!(
            class = %trace.class_name,
            nodes = onnx.graph.as_ref().map_or(0, |g| g.node.len()),
            external,
            "dynamic export written"
        );
        Ok(())
    }
}
