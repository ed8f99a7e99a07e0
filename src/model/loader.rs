use std::{fs, path::Path};

use tracing::{debug, error};

use crate::{
    args::DynamicArgs,
    engine::DEFAULT_MAX_TENSOR_ELEMENTS,
    model::{LoadError, Model, ModelLoader, registry::ClassRegistry},
};

/// Loads classes from YAML model-definition files.
///
/// Every call parses the file into a fresh namespace; nothing is shared between loads.
#[derive(Debug, Clone, Copy)]
pub struct DefinitionLoader {
    max_tensor_elements: usize,
}

impl Default for DefinitionLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionLoader {
    pub fn new() -> Self {
        Self {
            max_tensor_elements: DEFAULT_MAX_TENSOR_ELEMENTS,
        }
    }

    pub fn with_tensor_limit(mut self, max_elements: usize) -> Self {
        self.max_tensor_elements = max_elements;
        self
    }

    fn load_inner(
        &self,
        class_name: &str,
        source: &Path,
        args: &DynamicArgs,
    ) -> Result<Box<dyn Model>, LoadError> {
        debug!(class = class_name, path = %source.display(), "loading class from file");
        if !source.exists() {
            return Err(LoadError::NotFound(source.to_path_buf()));
        }

        let text = fs::read_to_string(source).map_err(|e| LoadError::Import {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        let registry =
            ClassRegistry::parse(source, &text)?.with_tensor_limit(self.max_tensor_elements);
        debug!(
            path = %source.display(),
            names = ?registry.names().collect::<Vec<_>>(),
            "loaded module"
        );

        debug!(class = class_name, ?args, "arguments passed to constructor");
        let network = registry.instantiate(class_name, args)?;
        Ok(Box::new(network))
    }
}

impl ModelLoader for DefinitionLoader {
    fn load(
        &self,
        class_name: &str,
        source: &Path,
        args: &DynamicArgs,
    ) -> Result<Box<dyn Model>, LoadError> {
        self.load_inner(class_name, source, args).inspect_err(|err| {
            error!(class = class_name, error = %err, "error loading class from file");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::parse_dynamic_args;
    use crate::engine::{DEFAULT_MAX_TENSOR_ELEMENTS, Device, random_input};
    use tempfile::TempDir;

    const SOURCE: &str = r#"
TinyCnn:
  params: { channels: 4, num_classes: ~ }
  layers:
    - conv2d: { in_channels: 3, out_channels: $channels, kernel_size: 3, padding: 1 }
    - relu
    - adaptive_avg_pool2d
    - flatten
    - linear: { in_features: $channels, out_features: $num_classes }
"#;

    fn write_source(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("tiny_cnn.yaml");
        fs::write(&path, SOURCE).unwrap();
        path
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = DefinitionLoader::new()
            .load("TinyCnn", &dir.path().join("absent.yaml"), &DynamicArgs::new())
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn missing_class_is_a_lookup_error() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir);
        let err = DefinitionLoader::new()
            .load("ResNet18", &path, &DynamicArgs::new())
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::ClassNotFound { .. }));
    }

    #[test]
    fn constructs_with_keyword_arguments() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir);
        let args = parse_dynamic_args("num_classes=5 channels=2").unwrap();
        let mut model = DefinitionLoader::new().load("TinyCnn", &path, &args).unwrap();
        model.eval();

        assert_eq!(model.class_name(), "TinyCnn");
        assert!(!model.is_training());
        let input = random_input(&[1, 3, 8, 8], Device::Cpu, DEFAULT_MAX_TENSOR_ELEMENTS).unwrap();
        let trace = model.trace(&input).unwrap();
        assert_eq!(trace.output_shape, vec![1, 5]);
    }

    #[test]
    fn each_load_gets_a_fresh_namespace() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir);
        let loader = DefinitionLoader::new();
        let args = parse_dynamic_args("num_classes=2").unwrap();
        assert!(loader.load("TinyCnn", &path, &args).is_ok());

        fs::write(&path, "Other: { layers: [relu] }").unwrap();
        let err = loader.load("TinyCnn", &path, &args).err().unwrap();
        assert!(matches!(err, LoadError::ClassNotFound { .. }));
    }
}
