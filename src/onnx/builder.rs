use crate::engine::{Op, Pool2d, Tensor, TracedNode};

use super::{
    OnnxError,
    proto::{
        AttributeProto, Dimension, DimensionValue, GraphProto, IR_VERSION, ModelProto, NodeProto,
        OperatorSetIdProto, StringStringEntryProto, TensorProto, ValueInfoProto, data_type,
    },
};

/// One axis of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Symbolic(String),
}

impl Dim {
    fn to_proto(&self) -> Dimension {
        let value = match self {
            Dim::Fixed(size) => DimensionValue::DimValue(*size as i64),
            Dim::Symbolic(name) => DimensionValue::DimParam(name.clone()),
        };
        Dimension {
            value: Some(value),
            denotation: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoweringOptions {
    pub opset: i64,
    pub input_name: String,
    pub output_name: String,
    pub input_dims: Vec<Dim>,
    pub output_dims: Vec<Dim>,
    /// Record traced shapes on every node.
    pub debug_shapes: bool,
    /// Recorded in the model metadata.
    pub exporter: String,
}

#[cfg(test)]
impl LoweringOptions {
    pub(crate) fn fixed(input_shape: &[usize], output_shape: &[usize]) -> Self {
        Self {
            opset: 17,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            input_dims: input_shape.iter().map(|d| Dim::Fixed(*d)).collect(),
            output_dims: output_shape.iter().map(|d| Dim::Fixed(*d)).collect(),
            debug_shapes: false,
            exporter: "fixed".to_string(),
        }
    }
}

struct GraphWriter<'a> {
    options: &'a LoweringOptions,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl GraphWriter<'_> {
    fn float_initializer(&mut self, name: String, tensor: &Tensor) -> String {
        self.initializers.push(float_tensor(&name, tensor));
        name
    }

    fn int64_initializer(&mut self, name: String, values: &[i64]) -> String {
        self.initializers.push(TensorProto {
            dims: vec![values.len() as i64],
            data_type: data_type::INT64,
            name: name.clone(),
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        });
        name
    }

    fn push(
        &mut self,
        layer: &TracedNode,
        op_type: &str,
        inputs: Vec<String>,
        output: String,
        attribute: Vec<AttributeProto>,
    ) {
        let count = self
            .nodes
            .iter()
            .filter(|n| n.name.starts_with(&format!("/{}/{op_type}", layer.name)))
            .count();
        let suffix = if count == 0 {
            String::new()
        } else {
            format!("_{count}")
        };
        let doc_string = if self.options.debug_shapes {
            format!("{:?} -> {:?}", layer.input_shape, layer.output_shape)
        } else {
            String::new()
        };
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output],
            name: format!("/{}/{op_type}{suffix}", layer.name),
            op_type: op_type.to_string(),
            attribute,
            doc_string,
            domain: String::new(),
        });
    }

    fn lower(
        &mut self,
        layer: &TracedNode,
        input: String,
        output: String,
    ) -> Result<(), OnnxError> {
        let prefix = &layer.name;
        let param = |name: &str| format!("{prefix}.{name}");
        let scratch = |tag: &str| format!("/{prefix}/{tag}_output_0");

        match &layer.op {
            Op::Linear { weight, bias } => {
                let w = self.float_initializer(param("weight"), weight);
                let b = bias.as_ref().map(|b| self.float_initializer(param("bias"), b));
                if layer.input_shape.len() == 2 {
                    let mut inputs = vec![input, w];
                    inputs.extend(b);
                    self.push(
                        layer,
                        "Gemm",
                        inputs,
                        output,
                        vec![
                            AttributeProto::float("alpha", 1.0),
                            AttributeProto::float("beta", 1.0),
                            AttributeProto::int("transB", 1),
                        ],
                    );
                } else {
                    let transposed = scratch("Transpose");
                    self.push(
                        layer,
                        "Transpose",
                        vec![w],
                        transposed.clone(),
                        vec![AttributeProto::ints("perm", vec![1, 0])],
                    );
                    match b {
                        Some(b) => {
                            let product = scratch("MatMul");
                            self.push(
                                layer,
                                "MatMul",
                                vec![input, transposed],
                                product.clone(),
                                vec![],
                            );
                            self.push(layer, "Add", vec![product, b], output, vec![]);
                        }
                        None => self.push(layer, "MatMul", vec![input, transposed], output, vec![]),
                    }
                }
            }
            Op::Conv2d {
                weight,
                bias,
                stride,
                padding,
            } => {
                let shape = weight.shape();
                if shape.len() != 4 {
                    return Err(OnnxError::Lowering {
                        layer: prefix.clone(),
                        reason: format!("conv weight must be 4-d, got {shape:?}"),
                    });
                }
                let kernel = vec![shape[2] as i64, shape[3] as i64];
                let mut inputs = vec![input, self.float_initializer(param("weight"), weight)];
                inputs.extend(bias.as_ref().map(|b| self.float_initializer(param("bias"), b)));
                let (s, p) = (*stride as i64, *padding as i64);
                self.push(
                    layer,
                    "Conv",
                    inputs,
                    output,
                    vec![
                        AttributeProto::ints("dilations", vec![1, 1]),
                        AttributeProto::int("group", 1),
                        AttributeProto::ints("kernel_shape", kernel),
                        AttributeProto::ints("pads", vec![p, p, p, p]),
                        AttributeProto::ints("strides", vec![s, s]),
                    ],
                );
            }
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                eps,
            } => {
                let inputs = vec![
                    input,
                    self.float_initializer(param("weight"), weight),
                    self.float_initializer(param("bias"), bias),
                    self.float_initializer(param("running_mean"), running_mean),
                    self.float_initializer(param("running_var"), running_var),
                ];
                self.push(
                    layer,
                    "BatchNormalization",
                    inputs,
                    output,
                    vec![
                        AttributeProto::float("epsilon", *eps),
                        AttributeProto::float("momentum", 0.9),
                    ],
                );
            }
            Op::Relu => self.push(layer, "Relu", vec![input], output, vec![]),
            Op::Sigmoid => self.push(layer, "Sigmoid", vec![input], output, vec![]),
            Op::Tanh => self.push(layer, "Tanh", vec![input], output, vec![]),
            Op::LeakyRelu { negative_slope } => self.push(
                layer,
                "LeakyRelu",
                vec![input],
                output,
                vec![AttributeProto::float("alpha", *negative_slope)],
            ),
            Op::Softmax { dim } => self.push(
                layer,
                "Softmax",
                vec![input],
                output,
                vec![AttributeProto::int("axis", *dim)],
            ),
            Op::Flatten { start_dim: 1 } => self.push(
                layer,
                "Flatten",
                vec![input],
                output,
                vec![AttributeProto::int("axis", 1)],
            ),
            Op::Flatten { start_dim } => {
                let mut target = vec![0i64; *start_dim];
                target.push(-1);
                let shape = self.int64_initializer(format!("/{prefix}/Constant_output_0"), &target);
                self.push(layer, "Reshape", vec![input, shape], output, vec![]);
            }
            Op::MaxPool2d(pool) => {
                self.push(layer, "MaxPool", vec![input], output, pool_attributes(pool, false))
            }
            Op::AvgPool2d(pool) => self.push(
                layer,
                "AveragePool",
                vec![input],
                output,
                pool_attributes(pool, true),
            ),
            Op::GlobalAvgPool2d => {
                self.push(layer, "GlobalAveragePool", vec![input], output, vec![])
            }
            Op::Reshape { shape } => {
                let mut target = vec![0i64];
                target.extend(shape);
                let shape = self.int64_initializer(format!("/{prefix}/Constant_output_0"), &target);
                self.push(layer, "Reshape", vec![input, shape], output, vec![]);
            }
            Op::Dropout { .. } | Op::Identity => {
                self.push(layer, "Identity", vec![input], output, vec![])
            }
        }
        Ok(())
    }
}

fn pool_attributes(pool: &Pool2d, count_include_pad: bool) -> Vec<AttributeProto> {
    let (k, s, p) = (
        pool.kernel_size as i64,
        pool.stride as i64,
        pool.padding as i64,
    );
    let mut attributes = vec![
        AttributeProto::int("ceil_mode", 0),
        AttributeProto::ints("kernel_shape", vec![k, k]),
        AttributeProto::ints("pads", vec![p, p, p, p]),
        AttributeProto::ints("strides", vec![s, s]),
    ];
    if count_include_pad {
        attributes.push(AttributeProto::int("count_include_pad", 1));
    }
    attributes
}

/// FLOAT initializer with little-endian `raw_data`.
pub fn float_tensor(name: &str, tensor: &Tensor) -> TensorProto {
    TensorProto {
        dims: tensor.shape().iter().map(|d| *d as i64).collect(),
        data_type: data_type::FLOAT,
        name: name.to_string(),
        raw_data: tensor.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

/// Lowers traced layers into a self-contained ONNX model.
pub fn build_model(
    class_name: &str,
    layers: &[TracedNode],
    options: &LoweringOptions,
) -> Result<ModelProto, OnnxError> {
    let mut writer = GraphWriter {
        options,
        nodes: Vec::new(),
        initializers: Vec::new(),
    };

    if layers.is_empty() {
        writer.nodes.push(NodeProto {
            input: vec![options.input_name.clone()],
            output: vec![options.output_name.clone()],
            name: "/Identity".to_string(),
            op_type: "Identity".to_string(),
            ..Default::default()
        });
    }

    let mut current = options.input_name.clone();
    for (idx, layer) in layers.iter().enumerate() {
        let output = if idx + 1 == layers.len() {
            options.output_name.clone()
        } else {
            format!("/{}/{}_output_0", layer.name, layer.op.kind())
        };
        writer.lower(layer, current, output.clone())?;
        current = output;
    }

    let graph = GraphProto {
        node: writer.nodes,
        name: class_name.to_string(),
        initializer: writer.initializers,
        input: vec![ValueInfoProto::tensor(
            &options.input_name,
            data_type::FLOAT,
            options.input_dims.iter().map(Dim::to_proto).collect(),
        )],
        output: vec![ValueInfoProto::tensor(
            &options.output_name,
            data_type::FLOAT,
            options.output_dims.iter().map(Dim::to_proto).collect(),
        )],
        ..Default::default()
    };

    Ok(ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: options.opset,
        }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        metadata_props: vec![
            StringStringEntryProto::new("source_class", class_name),
            StringStringEntryProto::new("exporter", options.exporter.clone()),
        ],
        ..Default::default()
    })
}
