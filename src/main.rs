use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onnx_export_service::{
    AppConfig, Converter, DefinitionLoader, S3Gateway, build_router, export::ExportPipeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        endpoint = %config.storage.endpoint,
        secure = config.storage.secure,
        dynamic_export = config.export.enable_dynamic_export,
        max_tensor_elements = config.max_tensor_elements,
        "configuring converter"
    );

    let store = Arc::new(S3Gateway::new(&config.storage)?);
    let pipeline = ExportPipeline::standard(&config.export);
    tracing::info!(strategies = ?pipeline.strategy_names(), "export pipeline ready");
    let loader = DefinitionLoader::new().with_tensor_limit(config.max_tensor_elements);
    let converter = Converter::new(store, Arc::new(loader), pipeline, config.device)
        .with_tensor_limit(config.max_tensor_elements);
    let router = build_router(config.clone(), converter);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
