pub mod args;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod export;
pub mod model;
pub mod onnx;
pub mod server;
pub mod storage;

pub use config::AppConfig;
pub use convert::Converter;
pub use model::{DefinitionLoader, ExportRequest, ExportResult};
pub use server::build_router;
pub use storage::{MemoryStore, ObjectStore, S3Gateway};
