use ndarray::{Axis, Ix1, Ix2, IxDyn};
use rand::Rng;

use super::{EngineError, Tensor, checked_numel, try_buffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2d {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

/// One layer of a traced network, carrying its parameters.
#[derive(Debug, Clone)]
pub enum Op {
    Linear {
        weight: Tensor,
        bias: Option<Tensor>,
    },
    Conv2d {
        weight: Tensor,
        bias: Option<Tensor>,
        stride: usize,
        padding: usize,
    },
    BatchNorm2d {
        weight: Tensor,
        bias: Tensor,
        running_mean: Tensor,
        running_var: Tensor,
        eps: f32,
    },
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu {
        negative_slope: f32,
    },
    Softmax {
        dim: i64,
    },
    Flatten {
        start_dim: usize,
    },
    MaxPool2d(Pool2d),
    AvgPool2d(Pool2d),
    GlobalAvgPool2d,
    Dropout {
        p: f32,
    },
    Reshape {
        shape: Vec<i64>,
    },
    Identity,
}

impl Op {
    pub fn linear(
        in_features: usize,
        out_features: usize,
        bias: bool,
    ) -> Result<Self, EngineError> {
        let bound = 1.0 / (in_features as f32).sqrt();
        Ok(Op::Linear {
            weight: uniform(&[out_features, in_features], bound)?,
            bias: bias.then(|| uniform(&[out_features], bound)).transpose()?,
        })
    }

    pub fn conv2d(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    ) -> Result<Self, EngineError> {
        let shape = [out_channels, in_channels, kernel_size, kernel_size];
        let fan_in = checked_numel(&shape[1..], usize::MAX)?;
        let bound = 1.0 / (fan_in as f32).sqrt();
        Ok(Op::Conv2d {
            weight: uniform(&shape, bound)?,
            bias: bias.then(|| uniform(&[out_channels], bound)).transpose()?,
            stride,
            padding,
        })
    }

    pub fn batch_norm2d(num_features: usize, eps: f32) -> Result<Self, EngineError> {
        Ok(Op::BatchNorm2d {
            weight: filled(num_features, 1.0)?,
            bias: filled(num_features, 0.0)?,
            running_mean: filled(num_features, 0.0)?,
            running_var: filled(num_features, 1.0)?,
            eps,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Linear { .. } => "linear",
            Op::Conv2d { .. } => "conv2d",
            Op::BatchNorm2d { .. } => "batch_norm2d",
            Op::Relu => "relu",
            Op::Sigmoid => "sigmoid",
            Op::Tanh => "tanh",
            Op::LeakyRelu { .. } => "leaky_relu",
            Op::Softmax { .. } => "softmax",
            Op::Flatten { .. } => "flatten",
            Op::MaxPool2d(_) => "max_pool2d",
            Op::AvgPool2d(_) => "avg_pool2d",
            Op::GlobalAvgPool2d => "adaptive_avg_pool2d",
            Op::Dropout { .. } => "dropout",
            Op::Reshape { .. } => "reshape",
            Op::Identity => "identity",
        }
    }

    pub fn parameters(&self) -> Vec<(&'static str, &Tensor)> {
        match self {
            Op::Linear { weight, bias } | Op::Conv2d { weight, bias, .. } => {
                let mut params = vec![("weight", weight)];
                if let Some(bias) = bias {
                    params.push(("bias", bias));
                }
                params
            }
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => vec![
                ("weight", weight),
                ("bias", bias),
                ("running_mean", running_mean),
                ("running_var", running_var),
            ],
            _ => Vec::new(),
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        match self {
            Op::Linear { weight, bias } | Op::Conv2d { weight, bias, .. } => {
                let mut params = vec![("weight", weight)];
                if let Some(bias) = bias {
                    params.push(("bias", bias));
                }
                params
            }
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => vec![
                ("weight", weight),
                ("bias", bias),
                ("running_mean", running_mean),
                ("running_var", running_var),
            ],
            _ => Vec::new(),
        }
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor, String> {
        match self {
            Op::Linear { weight, bias } => linear(x, weight, bias.as_ref()),
            Op::Conv2d {
                weight,
                bias,
                stride,
                padding,
            } => conv2d(x, weight, bias.as_ref(), *stride, *padding),
            Op::BatchNorm2d {
                weight,
                bias,
                running_mean,
                running_var,
                eps,
            } => batch_norm2d(x, weight, bias, running_mean, running_var, *eps, training),
            Op::Relu => Ok(x.mapv(|v| v.max(0.0))),
            Op::Sigmoid => Ok(x.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            Op::Tanh => Ok(x.mapv(f32::tanh)),
            Op::LeakyRelu { negative_slope } => {
                let slope = *negative_slope;
                Ok(x.mapv(|v| if v >= 0.0 { v } else { v * slope }))
            }
            Op::Softmax { dim } => softmax(x, *dim),
            Op::Flatten { start_dim } => flatten(x, *start_dim),
            Op::MaxPool2d(pool) => pool2d(x, pool, PoolKind::Max),
            Op::AvgPool2d(pool) => pool2d(x, pool, PoolKind::Avg),
            Op::GlobalAvgPool2d => global_avg_pool2d(x),
            Op::Dropout { p } if training => Ok(dropout(x, *p)),
            Op::Dropout { .. } | Op::Identity => Ok(x.clone()),
            Op::Reshape { shape } => reshape(x, shape),
        }
    }
}

fn uniform(shape: &[usize], bound: f32) -> Result<Tensor, EngineError> {
    let numel = checked_numel(shape, usize::MAX)?;
    let mut data = try_buffer(shape, numel)?;
    let mut rng = rand::rng();
    data.extend((0..numel).map(|_| rng.random_range(-bound..bound)));
    from_parts(shape, data)
}

fn filled(len: usize, value: f32) -> Result<Tensor, EngineError> {
    let mut data = try_buffer(&[len], len)?;
    data.resize(len, value);
    from_parts(&[len], data)
}

fn from_parts(shape: &[usize], data: Vec<f32>) -> Result<Tensor, EngineError> {
    Tensor::from_shape_vec(IxDyn(shape), data).map_err(|e| EngineError::Forward {
        layer: "init".into(),
        reason: e.to_string(),
    })
}

/// Output buffer for a kernel whose extents derive from layer options.
fn output_buffer(shape: &[usize]) -> Result<Vec<f32>, String> {
    let numel = checked_numel(shape, usize::MAX).map_err(|e| e.to_string())?;
    try_buffer(shape, numel).map_err(|e| e.to_string())
}

fn build(shape: &[usize], data: Vec<f32>) -> Result<Tensor, String> {
    Tensor::from_shape_vec(IxDyn(shape), data).map_err(|e| e.to_string())
}

fn expect_rank(x: &Tensor, rank: usize) -> Result<(), String> {
    if x.ndim() != rank {
        return Err(format!("expected {rank}-d input, got shape {:?}", x.shape()));
    }
    Ok(())
}

fn normalize_axis(dim: i64, ndim: usize) -> Result<usize, String> {
    let axis = if dim < 0 { dim + ndim as i64 } else { dim };
    if axis < 0 || axis >= ndim as i64 {
        return Err(format!("dimension {dim} out of range for {ndim}-d input"));
    }
    Ok(axis as usize)
}

fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, String> {
    let w = weight
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| e.to_string())?;
    let (out_features, in_features) = w.dim();
    let last = x.shape().last().copied().unwrap_or(0);
    if x.ndim() == 0 || last != in_features {
        return Err(format!(
            "input shape {:?} is incompatible with in_features={in_features}",
            x.shape()
        ));
    }

    let rows = x.len() / in_features;
    let x2 = x
        .to_shape((rows, in_features))
        .map_err(|e| e.to_string())?;
    let mut y = x2.dot(&w.t());
    if let Some(bias) = bias {
        let b = bias
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| e.to_string())?;
        y += &b;
    }

    let mut shape = x.shape()[..x.ndim() - 1].to_vec();
    shape.push(out_features);
    y.into_dyn()
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| e.to_string())
}

fn output_extent(
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize, String> {
    let padded = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(size))
        .ok_or_else(|| format!("padding {padding} overflows the input extent"))?;
    if padded < kernel || stride == 0 {
        return Err(format!(
            "kernel {kernel} does not fit input extent {size} with padding {padding}"
        ));
    }
    Ok((padded - kernel) / stride + 1)
}

fn conv2d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
) -> Result<Tensor, String> {
    expect_rank(x, 4)?;
    let (n, c, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (oc, ic, kh, kw) = (
        weight.shape()[0],
        weight.shape()[1],
        weight.shape()[2],
        weight.shape()[3],
    );
    if ic != c {
        return Err(format!("expected {ic} input channels, got {c}"));
    }
    let oh = output_extent(h, kh, stride, padding)?;
    let ow = output_extent(w, kw, stride, padding)?;

    let input: Vec<f32> = x.iter().copied().collect();
    let kernel: Vec<f32> = weight.iter().copied().collect();
    let bias: Vec<f32> = bias.map(|b| b.iter().copied().collect()).unwrap_or_default();

    let mut out = output_buffer(&[n, oc, oh, ow])?;
    out.resize(n * oc * oh * ow, 0.0);
    for b in 0..n {
        for o in 0..oc {
            let base = bias.get(o).copied().unwrap_or(0.0);
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = base;
                    for ci in 0..c {
                        for ky in 0..kh {
                            let iy = (y * stride + ky) as isize - padding as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (xo * stride + kx) as isize - padding as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let xi = ((b * c + ci) * h + iy as usize) * w + ix as usize;
                                let wi = ((o * c + ci) * kh + ky) * kw + kx;
                                acc += input[xi] * kernel[wi];
                            }
                        }
                    }
                    out[((b * oc + o) * oh + y) * ow + xo] = acc;
                }
            }
        }
    }
    build(&[n, oc, oh, ow], out)
}

fn batch_norm2d(
    x: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    running_mean: &Tensor,
    running_var: &Tensor,
    eps: f32,
    training: bool,
) -> Result<Tensor, String> {
    expect_rank(x, 4)?;
    let (n, c, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    if weight.len() != c {
        return Err(format!("expected {} channels, got {c}", weight.len()));
    }

    let (mean, var): (Vec<f32>, Vec<f32>) = if training {
        let spatial = (n * h * w) as f32;
        (0..c)
            .map(|ch| {
                let lane = x.index_axis(Axis(1), ch);
                let mean = lane.sum() / spatial;
                let var = lane.mapv(|v| (v - mean).powi(2)).sum() / spatial;
                (mean, var)
            })
            .unzip()
    } else {
        (
            running_mean.iter().copied().collect(),
            running_var.iter().copied().collect(),
        )
    };

    let gamma: Vec<f32> = weight.iter().copied().collect();
    let beta: Vec<f32> = bias.iter().copied().collect();
    let mut out = x.clone();
    for (ch, mut lane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let scale = gamma[ch] / (var[ch] + eps).sqrt();
        let shift = beta[ch] - mean[ch] * scale;
        lane.mapv_inplace(|v| v * scale + shift);
    }
    Ok(out)
}

fn softmax(x: &Tensor, dim: i64) -> Result<Tensor, String> {
    let axis = normalize_axis(dim, x.ndim())?;
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

fn flatten(x: &Tensor, start_dim: usize) -> Result<Tensor, String> {
    if start_dim >= x.ndim() {
        return Err(format!(
            "start_dim {start_dim} out of range for shape {:?}",
            x.shape()
        ));
    }
    let mut shape = x.shape()[..start_dim].to_vec();
    shape.push(x.shape()[start_dim..].iter().product());
    build(&shape, x.iter().copied().collect())
}

enum PoolKind {
    Max,
    Avg,
}

fn pool2d(x: &Tensor, pool: &Pool2d, kind: PoolKind) -> Result<Tensor, String> {
    expect_rank(x, 4)?;
    let (n, c, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let k = pool.kernel_size;
    let oh = output_extent(h, k, pool.stride, pool.padding)?;
    let ow = output_extent(w, k, pool.stride, pool.padding)?;
    let input: Vec<f32> = x.iter().copied().collect();

    let mut out = output_buffer(&[n, c, oh, ow])?;
    for plane in 0..n * c {
        for y in 0..oh {
            for xo in 0..ow {
                let mut max = f32::NEG_INFINITY;
                let mut sum = 0.0f32;
                for ky in 0..k {
                    let iy = (y * pool.stride + ky) as isize - pool.padding as isize;
                    for kx in 0..k {
                        let ix = (xo * pool.stride + kx) as isize - pool.padding as isize;
                        if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let v = input[(plane * h + iy as usize) * w + ix as usize];
                        max = max.max(v);
                        sum += v;
                    }
                }
                out.push(match kind {
                    PoolKind::Max => max,
                    PoolKind::Avg => sum / (k * k) as f32,
                });
            }
        }
    }
    build(&[n, c, oh, ow], out)
}

fn global_avg_pool2d(x: &Tensor) -> Result<Tensor, String> {
    expect_rank(x, 4)?;
    let (n, c) = (x.shape()[0], x.shape()[1]);
    let plane = (x.shape()[2] * x.shape()[3]).max(1) as f32;
    let data = x
        .lanes(Axis(3))
        .into_iter()
        .map(|lane| lane.sum())
        .collect::<Vec<f32>>()
        .chunks(x.shape()[2].max(1))
        .map(|rows| rows.iter().sum::<f32>() / plane)
        .collect();
    build(&[n, c, 1, 1], data)
}

fn dropout(x: &Tensor, p: f32) -> Tensor {
    if p <= 0.0 {
        return x.clone();
    }
    let mut rng = rand::rng();
    let keep = 1.0 - p;
    x.mapv(|v| {
        if keep > 0.0 && rng.random::<f32>() < keep {
            v / keep
        } else {
            0.0
        }
    })
}

/// Resolves a reshape target (batch dimension excluded) against an input shape.
pub(crate) fn resolve_reshape(input: &[usize], shape: &[i64]) -> Result<Vec<usize>, String> {
    let batch = input.first().copied().unwrap_or(1);
    let numel: usize = input.iter().product();
    let per_sample = if batch == 0 { 0 } else { numel / batch };

    let mut resolved = vec![batch];
    let mut inferred = None;
    let mut known = 1usize;
    for (idx, &dim) in shape.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => {
                inferred = Some(idx + 1);
                resolved.push(0);
            }
            d if d > 0 => {
                known = known
                    .checked_mul(d as usize)
                    .ok_or_else(|| format!("reshape target {shape:?} overflows"))?;
                resolved.push(d as usize);
            }
            d => return Err(format!("invalid reshape dimension {d}")),
        }
    }
    match inferred {
        Some(slot) if known > 0 && per_sample % known == 0 => resolved[slot] = per_sample / known,
        Some(_) => return Err(format!("cannot infer -1 in {shape:?} for input {input:?}")),
        None if known != per_sample => {
            return Err(format!("shape {shape:?} is invalid for input {input:?}"));
        }
        None => {}
    }
    Ok(resolved)
}

fn reshape(x: &Tensor, shape: &[i64]) -> Result<Tensor, String> {
    let target = resolve_reshape(x.shape(), shape)?;
    build(&target, x.iter().copied().collect())
}
