use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;
use tokio::task;
use tracing::{debug, info};

use crate::{
    args::{DynamicArgs, parse_dynamic_args},
    engine::{DEFAULT_MAX_TENSOR_ELEMENTS, DeviceRequest, random_input},
    error::ServiceError,
    export::{ExportPipeline, ExportReport},
    model::{ExportRequest, ExportResult, ModelLoader},
    onnx::check_model_file,
    storage::{MODELS_BUCKET, ONNX_BUCKET, ObjectStore, WEIGHTS_BUCKET},
};

/// Runs one conversion: download, load, export, validate, upload.
#[derive(Clone)]
pub struct Converter {
    store: Arc<dyn ObjectStore>,
    loader: Arc<dyn ModelLoader>,
    pipeline: Arc<ExportPipeline>,
    device: DeviceRequest,
    max_tensor_elements: usize,
}

struct ExportJob {
    class_name: String,
    source: PathBuf,
    weights: PathBuf,
    output: PathBuf,
    args: DynamicArgs,
    input_shape: Vec<usize>,
    max_tensor_elements: usize,
}

fn local_path(dir: &Path, key: &str) -> PathBuf {
    let name = Path::new(key)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| key.into());
    dir.join(name)
}

impl Converter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        loader: Arc<dyn ModelLoader>,
        pipeline: ExportPipeline,
        device: DeviceRequest,
    ) -> Self {
        Self {
            store,
            loader,
            pipeline: Arc::new(pipeline),
            device,
            max_tensor_elements: DEFAULT_MAX_TENSOR_ELEMENTS,
        }
    }

    /// Caps the example input; requests above it are rejected before any download.
    pub fn with_tensor_limit(mut self, max_elements: usize) -> Self {
        self.max_tensor_elements = max_elements;
        self
    }

    pub async fn execute(&self, request: ExportRequest) -> Result<ExportResult, ServiceError> {
        request.validate()?;
        request.check_input_size(self.max_tensor_elements)?;
        let args = parse_dynamic_args(request.args())?;
        info!(
            class = %request.model_class,
            source = %request.source_key,
            weights = %request.weights_key,
            ?args,
            "starting conversion"
        );

        let workdir = TempDir::new()?;
        self.store.check_connection().await?;

        let source = local_path(&workdir.path().join("source"), &request.source_key);
        let weights = local_path(&workdir.path().join("weights"), &request.weights_key);
        self.store
            .fetch(MODELS_BUCKET, &request.source_key, &source)
            .await?;
        self.store
            .fetch(WEIGHTS_BUCKET, &request.weights_key, &weights)
            .await?;

        let output_key = request.output_key();
        let job = ExportJob {
            class_name: request.model_class.clone(),
            source,
            weights,
            output: workdir.path().join(&output_key),
            args,
            input_shape: request.batched_input_shape(),
            max_tensor_elements: self.max_tensor_elements,
        };
        let output = job.output.clone();
        let loader = self.loader.clone();
        let pipeline = self.pipeline.clone();
        let device = self.device;
        let report =
            task::spawn_blocking(move || export_model(loader.as_ref(), &pipeline, device, job))
                .await
                .map_err(|err| ServiceError::Other(format!("export task failed: {err}")))??;

        self.store.ensure_bucket(ONNX_BUCKET).await?;
        self.store.put(ONNX_BUCKET, &output_key, &output).await?;
        let download_url = self.store.object_url(ONNX_BUCKET, &output_key);
        info!(
            key = %output_key,
            strategy = report.strategy,
            url = %download_url,
            "conversion finished"
        );

        Ok(ExportResult::success(
            output_key,
            download_url,
            report.warnings,
        ))
    }
}

fn export_model(
    loader: &dyn ModelLoader,
    pipeline: &ExportPipeline,
    device: DeviceRequest,
    job: ExportJob,
) -> Result<ExportReport, ServiceError> {
    let mut model = loader.load(&job.class_name, &job.source, &job.args)?;
    model.load_state_dict(&job.weights)?;

    let device = device.resolve(|d| model.supports_device(d))?;
    model.to_device(device)?;
    model.eval();
    debug!(class = %job.class_name, %device, training = model.is_training(), "model ready");

    let input = random_input(&job.input_shape, device, job.max_tensor_elements)?;

    let report = pipeline.run(model.as_ref(), &input, &job.output)?;
    check_model_file(&job.output)?;
    Ok(report)
}
