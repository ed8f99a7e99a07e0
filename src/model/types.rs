use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{engine::checked_numel, error::ServiceError};

pub const DEFAULT_INPUT_SHAPE: [usize; 3] = [3, 224, 224];

const REQUIRED_FIELDS: [&str; 3] = ["python_path", "weights_path", "model_class"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Key of the model definition in the models bucket.
    #[serde(rename = "python_path")]
    pub source_key: String,
    #[serde(rename = "weights_path")]
    pub weights_key: String,
    pub model_class: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub input_shape: Option<Vec<usize>>,
}

impl ExportRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, ServiceError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ServiceError::InvalidJson("Empty request body".into()));
        }
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ServiceError::InvalidJson(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(ServiceError::BadRequest(
                "request body must be a JSON object".into(),
            ));
        };
        for field in REQUIRED_FIELDS {
            match object.get(field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(ServiceError::MissingField(field));
                }
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                    return Err(ServiceError::MissingField(field));
                }
                _ => {}
            }
        }

        let request: ExportRequest = serde_json::from_value(value)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut chars = self.model_class.chars();
        let is_identifier = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier {
            return Err(ServiceError::BadRequest(format!(
                "model_class '{}' is not a valid class name",
                self.model_class
            )));
        }

        for (field, key) in [
            ("python_path", &self.source_key),
            ("weights_path", &self.weights_key),
        ] {
            if Path::new(key).file_name().is_none() {
                return Err(ServiceError::BadRequest(format!(
                    "{field} '{key}' does not name a file"
                )));
            }
        }

        if let Some(shape) = &self.input_shape {
            if shape.is_empty() || shape.contains(&0) {
                return Err(ServiceError::BadRequest(format!(
                    "input_shape must be a non-empty list of positive integers, got {shape:?}"
                )));
            }
        }
        self.check_input_size(usize::MAX)
    }

    /// Rejects inputs whose batched tensor would hold more than `max_elements` values.
    pub fn check_input_size(&self, max_elements: usize) -> Result<(), ServiceError> {
        checked_numel(&self.batched_input_shape(), max_elements)
            .map(|_| ())
            .map_err(|e| ServiceError::BadRequest(format!("input_shape is too large: {e}")))
    }

    pub fn args(&self) -> &str {
        self.args.as_deref().unwrap_or_default()
    }

    pub fn input_shape(&self) -> Vec<usize> {
        self.input_shape
            .clone()
            .unwrap_or_else(|| DEFAULT_INPUT_SHAPE.to_vec())
    }

    /// Shape of the example input: a batch of one.
    pub fn batched_input_shape(&self) -> Vec<usize> {
        let mut shape = vec![1];
        shape.extend(self.input_shape());
        shape
    }

    /// Object key of the exported graph.
    pub fn output_key(&self) -> String {
        format!("{}.onnx", self.model_class)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    pub status: String,
    pub message: String,
    pub onnx_path: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExportResult {
    pub fn success(onnx_path: String, download_url: String, warnings: Vec<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: "Model exported and validated successfully.".to_string(),
            onnx_path,
            download_url,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_request() {
        let body = br#"{"python_path": "nets/tiny.yaml", "weights_path": "tiny.safetensors",
            "model_class": "TinyNet", "args": "hidden=4", "input_shape": [3, 32, 32]}"#;
        let request = ExportRequest::from_json(body).unwrap();
        assert_eq!(request.source_key, "nets/tiny.yaml");
        assert_eq!(request.args(), "hidden=4");
        assert_eq!(request.input_shape(), vec![3, 32, 32]);
        assert_eq!(request.output_key(), "TinyNet.onnx");
    }

    #[test]
    fn applies_defaults() {
        let body = br#"{"python_path": "a.yaml", "weights_path": "a.safetensors",
            "model_class": "A", "args": null}"#;
        let request = ExportRequest::from_json(body).unwrap();
        assert_eq!(request.args(), "");
        assert_eq!(request.input_shape(), vec![3, 224, 224]);
        assert_eq!(request.batched_input_shape(), vec![1, 3, 224, 224]);
    }

    #[test]
    fn empty_body_is_invalid_json() {
        assert!(matches!(
            ExportRequest::from_json(b""),
            Err(ServiceError::InvalidJson(_))
        ));
        assert!(matches!(
            ExportRequest::from_json(b"{not json"),
            Err(ServiceError::InvalidJson(_))
        ));
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let body = br#"{"python_path": "a.yaml", "model_class": "A"}"#;
        assert!(matches!(
            ExportRequest::from_json(body),
            Err(ServiceError::MissingField("weights_path"))
        ));
        let body = br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": " "}"#;
        assert!(matches!(
            ExportRequest::from_json(body),
            Err(ServiceError::MissingField("model_class"))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let bodies: [&[u8]; 6] = [
            br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "../A"}"#,
            br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "A",
                "input_shape": [3, 0]}"#,
            br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "A",
                "input_shape": [-1]}"#,
            br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "A",
                "input_shape": []}"#,
            br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "A",
                "input_shape": [4294967296, 4294967296, 4294967296]}"#,
            br#"[1, 2]"#,
        ];
        for body in bodies {
            assert!(matches!(
                ExportRequest::from_json(body),
                Err(ServiceError::BadRequest(_))
            ));
        }
    }

    #[test]
    fn input_size_is_checked_against_limit() {
        let body = br#"{"python_path": "a.yaml", "weights_path": "w", "model_class": "A",
            "input_shape": [17592186044416]}"#;
        let request = ExportRequest::from_json(body).unwrap();
        let err = request.check_input_size(1 << 28).unwrap_err();
        assert_eq!(err.category(), "bad_request");
        assert!(err.to_string().contains("input_shape is too large"));

        let request = ExportRequest {
            input_shape: Some(vec![3, 8, 8]),
            ..request
        };
        assert!(request.check_input_size(192).is_ok());
        assert!(request.check_input_size(191).is_err());
    }

    #[test]
    fn warnings_are_omitted_when_empty() {
        let result = ExportResult::success("A.onnx".into(), "http://h/onnx/A.onnx".into(), vec![]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("warnings").is_none());
    }
}
