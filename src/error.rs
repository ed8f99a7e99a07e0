use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::{
    args::ArgsError,
    engine::EngineError,
    export::ExportError,
    model::LoadError,
    onnx::ValidationError,
    storage::StorageError,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid JSON")]
    InvalidJson(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("model error: {0}")]
    Engine(#[from] EngineError),
    #[error("ONNX export failed: {0}")]
    Export(#[from] ExportError),
    #[error("ONNX validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    /// Machine-readable failure category reported to callers.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::InvalidJson(_) => "invalid_json",
            ServiceError::MissingField(_) => "missing_field",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::Args(_) => "invalid_arguments",
            ServiceError::Storage(StorageError::Connection { .. }) => "connection",
            ServiceError::Storage(StorageError::NotFound { .. }) => "not_found",
            ServiceError::Storage(_) => "storage",
            ServiceError::Load(LoadError::NotFound(_)) => "not_found",
            ServiceError::Load(LoadError::Import { .. }) => "import",
            ServiceError::Load(LoadError::ClassNotFound { .. }) => "lookup",
            ServiceError::Load(_) => "type",
            ServiceError::Engine(_) => "model",
            ServiceError::Export(_) => "export",
            ServiceError::Validation(_) => "validation",
            ServiceError::Io(_) => "io",
            ServiceError::Other(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidJson(_)
            | ServiceError::MissingField(_)
            | ServiceError::BadRequest(_)
            | ServiceError::Args(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ServiceError::InvalidJson(details) => serde_json::json!({
                "error": self.to_string(),
                "category": self.category(),
                "details": details,
            }),
            _ => serde_json::json!({
                "error": self.to_string(),
                "category": self.category(),
            }),
        };

        (status, axum::Json(body)).into_response()
    }
}
