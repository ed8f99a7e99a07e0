use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::AppConfig,
    convert::Converter,
    error::ServiceError,
    model::{ExportRequest, ExportResult},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub converter: Converter,
}

pub fn build_router(config: Arc<AppConfig>, converter: Converter) -> Router {
    let state = AppState { config, converter };

    Router::new()
        .route("/", post(convert))
        .route("/convert", post(convert))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn convert(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExportResult>, ServiceError> {
    let request = ExportRequest::from_json(&body).inspect_err(|err| {
        info!(category = err.category(), error = %err, "rejected request");
    })?;
    let result = state.converter.execute(request).await.inspect_err(|err| {
        error!(
            category = err.category(),
            error = %err,
            endpoint = %state.config.storage.endpoint,
            "conversion failed"
        );
    })?;
    Ok(Json(result))
}
