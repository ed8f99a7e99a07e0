//! Ordered export strategies and the post-export single-file pass.

mod dynamic;
mod legacy;

use std::{fs, path::Path};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    engine::{EngineError, Tensor},
    model::Model,
    onnx::{Normalization, OnnxError, companion_path, ensure_single_file},
};

pub use dynamic::DynamicShapeExporter;
pub use legacy::{LegacyExporter, fold_constants};

pub const DEFAULT_EXTERNAL_DATA_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{strategy} exporter does not support {reason}")]
    Unsupported {
        strategy: &'static str,
        reason: String,
    },
    #[error("tracing failed: {0}")]
    Trace(#[from] EngineError),
    #[error(transparent)]
    Onnx(#[from] OnnxError),
    #[error("no export strategy is configured")]
    NoStrategies,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub enable_dynamic_export: bool,
    pub external_data_threshold: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            enable_dynamic_export: true,
            external_data_threshold: DEFAULT_EXTERNAL_DATA_THRESHOLD,
        }
    }
}

/// One way of turning a model into an ONNX file.
pub trait ExportStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn export(&self, model: &dyn Model, input: &Tensor, path: &Path) -> Result<(), ExportError>;

    /// Switch controlling side-car data output, for strategies that have one.
    fn external_data_toggle(&mut self) -> Option<&mut bool> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub strategy: &'static str,
    pub normalization: Normalization,
    pub warnings: Vec<String>,
}

pub struct ExportPipeline {
    strategies: Vec<Box<dyn ExportStrategy>>,
}

impl ExportPipeline {
    /// Builds a pipeline, switching off side-car data wherever a strategy allows it.
    pub fn new(mut strategies: Vec<Box<dyn ExportStrategy>>) -> Self {
        for strategy in &mut strategies {
            let name = strategy.name();
            if let Some(flag) = strategy.external_data_toggle() {
                *flag = false;
                debug!(strategy = name, "disabled external data format");
            }
        }
        Self { strategies }
    }

    pub fn standard(settings: &ExportSettings) -> Self {
        let mut strategies: Vec<Box<dyn ExportStrategy>> = Vec::new();
        if settings.enable_dynamic_export {
            strategies.push(Box::new(DynamicShapeExporter::new(
                settings.external_data_threshold,
            )));
        }
        strategies.push(Box::new(LegacyExporter::new(
            settings.external_data_threshold,
        )));
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Tries each strategy in order; only the last one's failure is fatal.
    pub fn run(
        &self,
        model: &dyn Model,
        input: &Tensor,
        path: &Path,
    ) -> Result<ExportReport, ExportError> {
        let mut warnings = Vec::new();
        let last = self.strategies.len().saturating_sub(1);

        for (idx, strategy) in self.strategies.iter().enumerate() {
            let name = strategy.name();
            info!(strategy = name, path = %path.display(), "exporting model");
            match strategy.export(model, input, path) {
                Ok(()) => {
                    let normalization = ensure_single_file(path);
                    warnings.extend(normalization.warning());
                    info!(strategy = name, ?normalization, "export finished");
                    return Ok(ExportReport {
                        strategy: name,
                        normalization,
                        warnings,
                    });
                }
                Err(err) if idx < last => {
                    warn!(strategy = name, error = %err, "export failed, trying next strategy");
                    warnings.push(format!("{name} export failed: {err}"));
                    remove_partial_output(path);
                }
                Err(err) => {
                    remove_partial_output(path);
                    return Err(err);
                }
            }
        }
        Err(ExportError::NoStrategies)
    }
}

fn remove_partial_output(path: &Path) {
    for file in [path.to_path_buf(), companion_path(path)] {
        if file.exists() {
            if let Err(err) = fs::remove_file(&file) {
                warn!(path = %file.display(), error = %err, "could not remove partial export");
            }
        }
    }
}
