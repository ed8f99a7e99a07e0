mod definition;
mod loader;
mod network;
mod registry;
mod types;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
    args::DynamicArgs,
    engine::{Device, EngineError, Tensor, Trace},
};

pub use loader::DefinitionLoader;
pub use network::Network;
pub use registry::ClassRegistry;
pub use types::{DEFAULT_INPUT_SHAPE, ExportRequest, ExportResult};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("unable to load model source {path}: {reason}")]
    Import { path: PathBuf, reason: String },
    #[error("Class '{class}' not found in module {path}")]
    ClassNotFound { class: String, path: PathBuf },
    #[error("'{0}' is not a valid class")]
    NotConstructible(String),
    #[error("{class}() {reason}")]
    InvalidArguments { class: String, reason: String },
    #[error("failed to construct {class}: {reason}")]
    Construct { class: String, reason: String },
}

/// An instantiated model that can be populated, placed and traced.
pub trait Model: Send {
    fn class_name(&self) -> &str;

    /// Strict load: every parameter must be present with a matching shape.
    fn load_state_dict(&mut self, weights: &Path) -> Result<(), EngineError>;

    fn supports_device(&self, device: Device) -> bool;

    fn to_device(&mut self, device: Device) -> Result<(), EngineError>;

    fn eval(&mut self);

    fn is_training(&self) -> bool;

    fn trace(&self, input: &Tensor) -> Result<Trace, EngineError>;
}

/// Loads a model class by name from a source file and calls its constructor.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        class_name: &str,
        source: &Path,
        args: &DynamicArgs,
    ) -> Result<Box<dyn Model>, LoadError>;
}
