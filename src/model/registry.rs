use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde_yaml::Value;

use crate::{
    args::DynamicArgs,
    engine::DEFAULT_MAX_TENSOR_ELEMENTS,
    model::{LoadError, definition::ClassDef, network::Network},
};

#[derive(Debug)]
enum Entry {
    Class(ClassDef),
    Value,
}

/// Names defined by one model source file.
#[derive(Debug)]
pub struct ClassRegistry {
    path: PathBuf,
    entries: BTreeMap<String, Entry>,
    max_tensor_elements: usize,
}

impl ClassRegistry {
    pub fn parse(path: &Path, source: &str) -> Result<Self, LoadError> {
        let import_error = |reason: String| LoadError::Import {
            path: path.to_path_buf(),
            reason,
        };

        let document: Value = if source.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(source).map_err(|e| import_error(e.to_string()))?
        };
        let mapping = match document {
            Value::Null => Default::default(),
            Value::Mapping(mapping) => mapping,
            _ => return Err(import_error("top level must be a mapping of names".into())),
        };

        let mut entries = BTreeMap::new();
        for (name, body) in mapping {
            let name = name
                .as_str()
                .ok_or_else(|| import_error(format!("names must be strings, got {name:?}")))?
                .to_string();
            let entry = match body.as_mapping() {
                Some(class_body) if ClassDef::is_class_body(&body) => Entry::Class(
                    ClassDef::from_yaml(class_body)
                        .map_err(|e| import_error(format!("class '{name}': {e}")))?,
                ),
                _ => Entry::Value,
            };
            entries.insert(name, entry);
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            max_tensor_elements: DEFAULT_MAX_TENSOR_ELEMENTS,
        })
    }

    /// Caps the element count of every parameter tensor a constructor allocates.
    pub fn with_tensor_limit(mut self, max_elements: usize) -> Self {
        self.max_tensor_elements = max_elements;
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn instantiate(&self, class: &str, args: &DynamicArgs) -> Result<Network, LoadError> {
        let def = match self.entries.get(class) {
            None => {
                return Err(LoadError::ClassNotFound {
                    class: class.to_string(),
                    path: self.path.clone(),
                });
            }
            Some(Entry::Value) => return Err(LoadError::NotConstructible(class.to_string())),
            Some(Entry::Class(def)) => def,
        };

        let bound = def.bind(args).map_err(|reason| LoadError::InvalidArguments {
            class: class.to_string(),
            reason,
        })?;
        let layers = def
            .build_layers(&bound, self.max_tensor_elements)
            .map_err(|reason| LoadError::Construct {
            class: class.to_string(),
            reason,
        })?;
        Ok(Network::new(class, layers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::parse_dynamic_args;

    const SOURCE: &str = r#"
hidden_default: 8
TinyNet:
  params: { in_features: ~, out_features: 2 }
  layers:
    - linear: { in_features: $in_features, out_features: $out_features }
    - relu
"#;

    fn registry() -> ClassRegistry {
        ClassRegistry::parse(Path::new("tiny.yaml"), SOURCE).unwrap()
    }

    #[test]
    fn lists_every_name() {
        let names: Vec<_> = registry().names().map(str::to_string).collect();
        assert_eq!(names, vec!["TinyNet", "hidden_default"]);
    }

    #[test]
    fn instantiates_class_with_keyword_arguments() {
        let net = registry()
            .instantiate("TinyNet", &parse_dynamic_args("in_features=5").unwrap())
            .unwrap();
        assert_eq!(net.state_dict_keys(), vec!["0.weight", "0.bias"]);
    }

    #[test]
    fn missing_class_is_a_lookup_error() {
        let err = registry()
            .instantiate("ResNet", &DynamicArgs::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::ClassNotFound { ref class, .. } if class == "ResNet"));
    }

    #[test]
    fn plain_value_is_not_constructible() {
        let err = registry()
            .instantiate("hidden_default", &DynamicArgs::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::NotConstructible(_)));
    }

    #[test]
    fn bad_arguments_are_type_errors() {
        let err = registry()
            .instantiate("TinyNet", &DynamicArgs::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidArguments { .. }));
    }

    #[test]
    fn oversized_constructor_arguments_fail_to_construct() {
        let args = parse_dynamic_args("in_features=100000000000000").unwrap();
        let err = registry().instantiate("TinyNet", &args).unwrap_err();
        assert!(matches!(err, LoadError::Construct { ref class, .. } if class == "TinyNet"));

        let small = registry().with_tensor_limit(9);
        let args = parse_dynamic_args("in_features=5").unwrap();
        assert!(matches!(
            small.instantiate("TinyNet", &args),
            Err(LoadError::Construct { .. })
        ));
    }

    #[test]
    fn syntax_errors_are_import_errors() {
        let err = ClassRegistry::parse(Path::new("bad.yaml"), "Net: [unclosed").unwrap_err();
        assert!(matches!(err, LoadError::Import { .. }));

        let err = ClassRegistry::parse(Path::new("list.yaml"), "- a\n- b").unwrap_err();
        assert!(matches!(err, LoadError::Import { .. }));
    }

    #[test]
    fn empty_source_is_an_empty_namespace() {
        let registry = ClassRegistry::parse(Path::new("empty.yaml"), "").unwrap();
        assert_eq!(registry.names().count(), 0);
    }
}
