use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use tracing::{debug, info, warn};

use super::{
    OnnxError, companion_path, load_model, save_model,
    proto::{ModelProto, StringStringEntryProto, TensorProto, data_location},
};

/// What the single-file pass did to an exported model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalization {
    Unchanged,
    Inlined { tensors: usize },
    StrippedDanglingReferences { tensors: usize },
    Failed { reason: String },
}

impl Normalization {
    /// Caller-facing note when the single-file guarantee may not hold.
    pub fn warning(&self) -> Option<String> {
        match self {
            Normalization::Unchanged | Normalization::Inlined { .. } => None,
            Normalization::StrippedDanglingReferences { tensors } => Some(format!(
                "stripped {tensors} dangling external-data reference(s) from the exported graph"
            )),
            Normalization::Failed { reason } => {
                Some(format!("could not inline external data: {reason}"))
            }
        }
    }
}

/// Saves `model` to `path`, moving initializers of at least `threshold` bytes into
/// the companion data file. Returns the number of externalized tensors.
pub fn write_with_external_data(
    model: &ModelProto,
    path: &Path,
    threshold: usize,
) -> Result<usize, OnnxError> {
    let mut model = model.clone();
    let companion = companion_path(path);
    let location = companion
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut data = Vec::new();
    let mut moved = 0;
    if let Some(graph) = model.graph.as_mut() {
        for tensor in graph
            .initializer
            .iter_mut()
            .filter(|t| !t.raw_data.is_empty() && t.raw_data.len() >= threshold)
        {
            let offset = data.len();
            let payload = std::mem::take(&mut tensor.raw_data);
            data.extend_from_slice(&payload);
            tensor.external_data = vec![
                StringStringEntryProto::new("location", location.clone()),
                StringStringEntryProto::new("offset", offset.to_string()),
                StringStringEntryProto::new("length", payload.len().to_string()),
            ];
            tensor.data_location = data_location::EXTERNAL;
            moved += 1;
        }
    }

    if moved > 0 {
        let mut file = File::create(&companion).map_err(|e| OnnxError::io(&companion, e))?;
        file.write_all(&data)
            .map_err(|e| OnnxError::io(&companion, e))?;
        debug!(
            path = %companion.display(),
            tensors = moved,
            bytes = data.len(),
            "wrote external data"
        );
    }
    save_model(&model, path)?;
    Ok(moved)
}

fn resolve_location(base: &Path, tensor: &TensorProto) -> Result<PathBuf, OnnxError> {
    let location = tensor
        .external_entry("location")
        .ok_or_else(|| OnnxError::ExternalData {
            tensor: tensor.name.clone(),
            reason: "missing location".into(),
        })?;
    let relative = Path::new(location);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(OnnxError::ExternalData {
            tensor: tensor.name.clone(),
            reason: format!("location '{location}' escapes the model directory"),
        });
    }
    Ok(base.join(relative))
}

fn parse_entry(tensor: &TensorProto, key: &str) -> Result<Option<u64>, OnnxError> {
    tensor
        .external_entry(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|e| OnnxError::ExternalData {
                tensor: tensor.name.clone(),
                reason: format!("invalid {key} '{raw}': {e}"),
            })
        })
        .transpose()
}

fn read_external(file: &Path, tensor: &TensorProto) -> Result<Vec<u8>, OnnxError> {
    let offset = parse_entry(tensor, "offset")?.unwrap_or(0);
    let mut handle = File::open(file).map_err(|e| OnnxError::io(file, e))?;
    handle
        .seek(SeekFrom::Start(offset))
        .map_err(|e| OnnxError::io(file, e))?;

    let mut data = Vec::new();
    match parse_entry(tensor, "length")? {
        Some(length) => {
            data.resize(length as usize, 0);
            handle
                .read_exact(&mut data)
                .map_err(|e| OnnxError::io(file, e))?;
        }
        None => {
            handle
                .read_to_end(&mut data)
                .map_err(|e| OnnxError::io(file, e))?;
        }
    }
    Ok(data)
}

fn normalize(path: &Path) -> Result<Normalization, OnnxError> {
    let base = path.parent().unwrap_or(Path::new("."));
    let companion = companion_path(path);
    let mut model = load_model(path)?;
    let Some(graph) = model.graph.as_mut() else {
        return Ok(Normalization::Unchanged);
    };

    let external: Vec<usize> = graph
        .initializer
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_external())
        .map(|(idx, _)| idx)
        .collect();

    let mut locations = BTreeSet::new();
    for &idx in &external {
        if let Ok(file) = resolve_location(base, &graph.initializer[idx]) {
            if file.exists() {
                locations.insert(file);
            }
        }
    }

    if companion.exists() || !locations.is_empty() {
        for &idx in &external {
            let tensor = &mut graph.initializer[idx];
            let file = resolve_location(base, tensor)?;
            tensor.raw_data = read_external(&file, tensor)?;
            tensor.external_data.clear();
            tensor.data_location = data_location::DEFAULT;
        }
        save_model(&model, path)?;

        locations.insert(companion);
        for file in locations.iter().filter(|f| f.exists()) {
            fs::remove_file(file).map_err(|e| OnnxError::io(file, e))?;
        }
        info!(path = %path.display(), tensors = external.len(), "inlined external data");
        return Ok(Normalization::Inlined {
            tensors: external.len(),
        });
    }

    if !external.is_empty() {
        for &idx in &external {
            let tensor = &mut graph.initializer[idx];
            tensor.external_data.clear();
            tensor.data_location = data_location::DEFAULT;
        }
        save_model(&model, path)?;
        warn!(
            path = %path.display(),
            tensors = external.len(),
            "stripped dangling external-data references"
        );
        return Ok(Normalization::StrippedDanglingReferences {
            tensors: external.len(),
        });
    }

    Ok(Normalization::Unchanged)
}

/// Best-effort rewrite of `path` into a single self-contained file.
///
/// Never fails; problems are logged and reported through the returned outcome.
pub fn ensure_single_file(path: &Path) -> Normalization {
    match normalize(path) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not normalize external data");
            Normalization::Failed {
                reason: err.to_string(),
            }
        }
    }
}
