use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::{Mapping, Value};

use crate::{
    args::{ArgValue, DynamicArgs},
    engine::{Op, Pool2d, checked_numel},
};

/// A resolved constructor parameter or layer option.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn from_yaml(value: &Value) -> Option<Scalar> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<&ArgValue> for Scalar {
    fn from(value: &ArgValue) -> Self {
        match value {
            ArgValue::Int(v) => Scalar::Int(*v),
            ArgValue::Float(v) => Scalar::Float(*v),
            ArgValue::Str(v) => Scalar::Str(v.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LayerSpec {
    kind: String,
    options: Mapping,
}

/// Body of a class entry: keyword parameters with defaults and a layer list.
#[derive(Debug, Clone)]
pub(crate) struct ClassDef {
    params: Vec<(String, Option<Scalar>)>,
    layers: Vec<LayerSpec>,
}

impl ClassDef {
    pub(crate) fn is_class_body(value: &Value) -> bool {
        value
            .as_mapping()
            .is_some_and(|m| m.contains_key(Value::from("layers")))
    }

    pub(crate) fn from_yaml(body: &Mapping) -> Result<Self, String> {
        for key in body.keys() {
            match key.as_str() {
                Some("params" | "layers" | "doc") => {}
                _ => return Err(format!("unexpected class attribute {key:?}")),
            }
        }

        let mut params = Vec::new();
        match body.get("params") {
            None | Some(Value::Null) => {}
            Some(Value::Mapping(map)) => {
                for (name, default) in map {
                    let name = name
                        .as_str()
                        .ok_or_else(|| format!("parameter names must be strings, got {name:?}"))?;
                    let default = match default {
                        Value::Null => None,
                        other => Some(Scalar::from_yaml(other).ok_or_else(|| {
                            format!("unsupported default for parameter '{name}'")
                        })?),
                    };
                    params.push((name.to_string(), default));
                }
            }
            Some(_) => return Err("'params' must be a mapping".into()),
        }

        let Some(Value::Sequence(entries)) = body.get("layers") else {
            return Err("'layers' must be a list".into());
        };
        let layers = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                LayerSpec::from_yaml(entry).map_err(|e| format!("layer {idx}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { params, layers })
    }

    /// Binds keyword arguments the way a Python constructor call would.
    pub(crate) fn bind(&self, args: &DynamicArgs) -> Result<BTreeMap<String, Scalar>, String> {
        for (key, _) in args.iter() {
            if !self.params.iter().any(|(name, _)| name == key) {
                return Err(format!("got an unexpected keyword argument '{key}'"));
            }
        }

        let mut bound = BTreeMap::new();
        let mut missing = Vec::new();
        for (name, default) in &self.params {
            match args.get(name).map(Scalar::from).or_else(|| default.clone()) {
                Some(value) => {
                    bound.insert(name.clone(), value);
                }
                None => missing.push(format!("'{name}'")),
            }
        }
        if !missing.is_empty() {
            return Err(format!(
                "missing required argument(s): {}",
                missing.join(", ")
            ));
        }
        Ok(bound)
    }

    /// Builds every layer; parameter tensors larger than `max_elements` are refused.
    pub(crate) fn build_layers(
        &self,
        bound: &BTreeMap<String, Scalar>,
        max_elements: usize,
    ) -> Result<Vec<Op>, String> {
        self.layers
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                spec.build(bound, max_elements)
                    .map_err(|e| format!("layer {idx} ({}): {e}", spec.kind))
            })
            .collect()
    }
}

impl LayerSpec {
    fn from_yaml(entry: &Value) -> Result<Self, String> {
        match entry {
            Value::String(kind) => Ok(Self {
                kind: kind.clone(),
                options: Mapping::new(),
            }),
            Value::Mapping(map) if map.len() == 1 => {
                let (kind, options) = map
                    .iter()
                    .next()
                    .ok_or_else(|| "empty layer entry".to_string())?;
                let kind = kind
                    .as_str()
                    .ok_or_else(|| format!("layer kind must be a string, got {kind:?}"))?;
                let options = match options {
                    Value::Null => Mapping::new(),
                    Value::Mapping(options) => options.clone(),
                    _ => return Err(format!("options of '{kind}' must be a mapping")),
                };
                Ok(Self {
                    kind: kind.to_string(),
                    options,
                })
            }
            _ => Err("expected a layer name or a single-key mapping".into()),
        }
    }

    fn build(&self, bound: &BTreeMap<String, Scalar>, max_elements: usize) -> Result<Op, String> {
        let within = |shape: &[usize]| {
            checked_numel(shape, max_elements)
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        let normalized: String = self
            .kind
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_lowercase();

        let op = match normalized.as_str() {
            "linear" => {
                let mut opts = Options::new(self, bound, &["in_features", "out_features", "bias"])?;
                let in_features = opts.positive("in_features")?;
                let out_features = opts.positive("out_features")?;
                within(&[out_features, in_features])?;
                Op::linear(in_features, out_features, opts.bool_or("bias", true)?)
                    .map_err(|e| e.to_string())?
            }
            "conv2d" => {
                let mut opts = Options::new(
                    self,
                    bound,
                    &["in_channels", "out_channels", "kernel_size", "stride", "padding", "bias"],
                )?;
                let in_channels = opts.positive("in_channels")?;
                let out_channels = opts.positive("out_channels")?;
                let kernel_size = opts.positive("kernel_size")?;
                within(&[out_channels, in_channels, kernel_size, kernel_size])?;
                Op::conv2d(
                    in_channels,
                    out_channels,
                    kernel_size,
                    opts.positive_or("stride", 1)?,
                    opts.usize_or("padding", 0)?,
                    opts.bool_or("bias", true)?,
                )
                .map_err(|e| e.to_string())?
            }
            "batchnorm2d" => {
                let mut opts = Options::new(self, bound, &["num_features", "eps"])?;
                let num_features = opts.positive("num_features")?;
                within(&[num_features])?;
                Op::batch_norm2d(num_features, opts.f32_or("eps", 1e-5)?)
                    .map_err(|e| e.to_string())?
            }
            "relu" => {
                Options::new(self, bound, &[])?;
                Op::Relu
            }
            "sigmoid" => {
                Options::new(self, bound, &[])?;
                Op::Sigmoid
            }
            "tanh" => {
                Options::new(self, bound, &[])?;
                Op::Tanh
            }
            "leakyrelu" => {
                let mut opts = Options::new(self, bound, &["negative_slope"])?;
                Op::LeakyRelu {
                    negative_slope: opts.f32_or("negative_slope", 0.01)?,
                }
            }
            "softmax" => {
                let mut opts = Options::new(self, bound, &["dim"])?;
                Op::Softmax {
                    dim: opts.i64_or("dim", -1)?,
                }
            }
            "flatten" => {
                let mut opts = Options::new(self, bound, &["start_dim"])?;
                let start_dim = opts.usize_or("start_dim", 1)?;
                if start_dim == 0 {
                    return Err("start_dim 0 would merge the batch dimension".into());
                }
                Op::Flatten { start_dim }
            }
            "maxpool2d" | "avgpool2d" => {
                let mut opts = Options::new(self, bound, &["kernel_size", "stride", "padding"])?;
                let kernel_size = opts.positive("kernel_size")?;
                let pool = Pool2d {
                    kernel_size,
                    stride: opts.positive_or("stride", kernel_size)?,
                    padding: opts.usize_or("padding", 0)?,
                };
                if pool.padding * 2 > kernel_size {
                    return Err("padding should be at most half of kernel_size".into());
                }
                if normalized == "maxpool2d" {
                    Op::MaxPool2d(pool)
                } else {
                    Op::AvgPool2d(pool)
                }
            }
            "adaptiveavgpool2d" => {
                let mut opts = Options::new(self, bound, &["output_size"])?;
                match opts.usize_or("output_size", 1)? {
                    1 => Op::GlobalAvgPool2d,
                    other => return Err(format!("output_size {other} is not supported, only 1")),
                }
            }
            "dropout" => {
                let mut opts = Options::new(self, bound, &["p"])?;
                let p = opts.f32_or("p", 0.5)?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(format!(
                        "dropout probability has to be between 0 and 1, but got {p}"
                    ));
                }
                Op::Dropout { p }
            }
            "reshape" => {
                let mut opts = Options::new(self, bound, &["shape"])?;
                Op::Reshape {
                    shape: opts.shape("shape")?,
                }
            }
            "identity" => {
                Options::new(self, bound, &[])?;
                Op::Identity
            }
            _ => return Err(format!("unknown layer kind '{}'", self.kind)),
        };
        Ok(op)
    }
}

struct Options<'a> {
    values: &'a Mapping,
    bound: &'a BTreeMap<String, Scalar>,
}

impl<'a> Options<'a> {
    fn new(
        spec: &'a LayerSpec,
        bound: &'a BTreeMap<String, Scalar>,
        allowed: &[&str],
    ) -> Result<Self, String> {
        let allowed: BTreeSet<&str> = allowed.iter().copied().collect();
        for key in spec.options.keys() {
            match key.as_str() {
                Some(name) if allowed.contains(name) => {}
                _ => return Err(format!("unexpected option {key:?}")),
            }
        }
        Ok(Self {
            values: &spec.options,
            bound,
        })
    }

    fn resolve(&self, value: &Value) -> Result<Scalar, String> {
        if let Some(name) = value.as_str().and_then(|s| s.strip_prefix('$')) {
            return self
                .bound
                .get(name)
                .cloned()
                .ok_or_else(|| format!("undefined parameter '${name}'"));
        }
        Scalar::from_yaml(value).ok_or_else(|| format!("unsupported option value {value:?}"))
    }

    fn get(&mut self, key: &str) -> Result<Option<Scalar>, String> {
        self.values.get(key).map(|v| self.resolve(v)).transpose()
    }

    fn i64_or(&mut self, key: &str, default: i64) -> Result<i64, String> {
        match self.get(key)? {
            None => Ok(default),
            Some(Scalar::Int(v)) => Ok(v),
            Some(other) => Err(format!("'{key}' must be an integer, got {other:?}")),
        }
    }

    fn usize_or(&mut self, key: &str, default: usize) -> Result<usize, String> {
        let value = self.i64_or(key, default as i64)?;
        usize::try_from(value).map_err(|_| format!("'{key}' must be non-negative, got {value}"))
    }

    fn positive_or(&mut self, key: &str, default: usize) -> Result<usize, String> {
        match self.usize_or(key, default)? {
            0 => Err(format!("'{key}' must be positive")),
            v => Ok(v),
        }
    }

    fn positive(&mut self, key: &str) -> Result<usize, String> {
        if !self.values.contains_key(key) {
            return Err(format!("missing option '{key}'"));
        }
        self.positive_or(key, 1)
    }

    fn f32_or(&mut self, key: &str, default: f32) -> Result<f32, String> {
        match self.get(key)? {
            None => Ok(default),
            Some(Scalar::Int(v)) => Ok(v as f32),
            Some(Scalar::Float(v)) => Ok(v as f32),
            Some(other) => Err(format!("'{key}' must be a number, got {other:?}")),
        }
    }

    fn bool_or(&mut self, key: &str, default: bool) -> Result<bool, String> {
        match self.get(key)? {
            None => Ok(default),
            Some(Scalar::Bool(b)) => Ok(b),
            Some(Scalar::Int(0)) => Ok(false),
            Some(Scalar::Int(1)) => Ok(true),
            Some(Scalar::Str(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(Scalar::Str(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(other) => Err(format!("'{key}' must be a boolean, got {other:?}")),
        }
    }

    fn shape(&mut self, key: &str) -> Result<Vec<i64>, String> {
        let Some(Value::Sequence(items)) = self.values.get(key) else {
            return Err(format!("'{key}' must be a list of integers"));
        };
        let dims = items
            .iter()
            .map(|item| match self.resolve(item)? {
                Scalar::Int(v) if v == -1 || v > 0 => Ok(v),
                other => Err(format!("invalid dimension {other:?} in '{key}'")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if dims.iter().filter(|d| **d == -1).count() > 1 {
            return Err("only one dimension can be inferred".into());
        }
        Ok(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args::parse_dynamic_args, engine::DEFAULT_MAX_TENSOR_ELEMENTS};

    fn class(yaml: &str) -> ClassDef {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        ClassDef::from_yaml(value.as_mapping().unwrap()).unwrap()
    }

    #[test]
    fn binds_defaults_and_overrides() {
        let def = class(
            "params: { hidden: 16, classes: ~ }\nlayers: [relu]",
        );
        let bound = def.bind(&parse_dynamic_args("classes=3").unwrap()).unwrap();
        assert_eq!(bound.get("hidden"), Some(&Scalar::Int(16)));
        assert_eq!(bound.get("classes"), Some(&Scalar::Int(3)));
    }

    #[test]
    fn rejects_unknown_and_missing_arguments() {
        let def = class("params: { classes: ~ }\nlayers: [relu]");
        let err = def.bind(&parse_dynamic_args("depth=2 classes=1").unwrap()).unwrap_err();
        assert!(err.contains("unexpected keyword argument 'depth'"));

        let err = def.bind(&DynamicArgs::new()).unwrap_err();
        assert!(err.contains("'classes'"));
    }

    #[test]
    fn resolves_parameter_references() {
        let def = class(
            "params: { width: 4 }\nlayers:\n  - linear: { in_features: 2, out_features: $width }\n  - Dropout: { p: 0.1 }",
        );
        let bound = def.bind(&DynamicArgs::new()).unwrap();
        let layers = def.build_layers(&bound, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].parameters()[0].1.shape(), &[4, 2]);
        assert_eq!(layers[1].kind(), "dropout");
    }

    #[test]
    fn reports_bad_layers() {
        let bound = BTreeMap::new();
        for (yaml, needle) in [
            ("layers: [conv3d]", "unknown layer kind"),
            ("layers: [{linear: {in_features: 2}}]", "missing option 'out_features'"),
            ("layers: [{linear: {in_features: 2, out_features: 2, gain: 1}}]", "unexpected option"),
            ("layers: [{linear: {in_features: $x, out_features: 2}}]", "undefined parameter '$x'"),
            ("layers: [{adaptive_avg_pool2d: {output_size: 7}}]", "not supported"),
            ("layers: [{reshape: {shape: [-1, -1]}}]", "only one dimension"),
        ] {
            let err = class(yaml).build_layers(&bound, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap_err();
            assert!(err.contains(needle), "{yaml}: {err}");
        }
    }

    #[test]
    fn oversized_parameters_are_refused_before_allocation() {
        let def = class(
            "params: { hidden: 8 }\nlayers: [{linear: {in_features: 4, out_features: $hidden}}]",
        );
        let bound = def
            .bind(&parse_dynamic_args("hidden=100000000000000").unwrap())
            .unwrap();
        let err = def.build_layers(&bound, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap_err();
        assert!(err.contains("exceeds the limit"), "{err}");

        let def = class("layers: [{conv2d: {in_channels: 3, out_channels: 8, kernel_size: 3}}]");
        let err = def.build_layers(&BTreeMap::new(), 100).unwrap_err();
        assert!(err.contains("layer 0 (conv2d)"), "{err}");
        assert!(def.build_layers(&BTreeMap::new(), 216).is_ok());
    }

    #[test]
    fn bias_accepts_string_arguments() {
        let def = class(
            "params: { use_bias: true }\nlayers: [{linear: {in_features: 2, out_features: 2, bias: $use_bias}}]",
        );
        let bound = def.bind(&parse_dynamic_args("use_bias=false").unwrap()).unwrap();
        let layers = def.build_layers(&bound, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        assert_eq!(layers[0].parameters().len(), 1);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        let value: Value = serde_yaml::from_str("layers: relu").unwrap();
        assert!(ClassDef::from_yaml(value.as_mapping().unwrap()).is_err());

        let value: Value = serde_yaml::from_str("layers: []\nforward: x").unwrap();
        assert!(ClassDef::from_yaml(value.as_mapping().unwrap()).is_err());
    }
}
