//! Checkpoint loading for the ReCam DiT
//!
//! Handles:
//!
//! - Single file and sharded checkpoints (`*.safetensors.index.json`)
//! - Header-only inspection (names, shapes, fingerprint)
//! - Convention conversion through [`StateDictConverter`]
//! - Loading into a [`VarMap`] so camera adapters and clean-latent embedders
//!   missing from a base checkpoint keep their initial values

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::WanModelConfig;
use crate::model::WanModel;
use crate::weight_format::{ConvertedStateDict, StateDictConverter, hash_state_dict_keys};

/// Errors that can occur during checkpoint loading
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing shard files: {missing:?}")]
    MissingShards { missing: Vec<String> },

    #[error("No safetensors files found in directory: {path}")]
    NoSafetensorsFound { path: String },

    #[error("Checkpoint is missing required tensors: {missing:?}")]
    MissingTensors { missing: Vec<String> },

    #[error("Invalid model configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

type LoadResult<T> = std::result::Result<T, LoaderError>;

/// Parsed `*.safetensors.index.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetensorsIndex {
    /// Tensor name → shard file name
    pub weight_map: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SafetensorsIndex {
    pub fn load(path: impl AsRef<Path>) -> LoadResult<Self> {
        load_model_config(path)
    }

    /// Unique shard files, sorted
    pub fn shard_files(&self) -> Vec<String> {
        let files: HashSet<_> = self.weight_map.values().collect();
        let mut result: Vec<_> = files.into_iter().cloned().collect();
        result.sort();
        result
    }
}

const INDEX_FILES: [&str; 2] = [
    "diffusion_pytorch_model.safetensors.index.json",
    "model.safetensors.index.json",
];

/// Resolve a checkpoint path to its safetensors files.
///
/// A file is returned as is. A directory is resolved through an index file
/// when present, otherwise every `*.safetensors` inside it is used.
pub fn resolve_checkpoint_files(path: impl AsRef<Path>) -> LoadResult<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    for index_name in INDEX_FILES {
        let index_path = path.join(index_name);
        if !index_path.exists() {
            continue;
        }
        let index = SafetensorsIndex::load(&index_path)?;
        let mut missing = Vec::new();
        let mut paths = Vec::new();
        for shard in index.shard_files() {
            let shard_path = path.join(&shard);
            if shard_path.exists() {
                paths.push(shard_path);
            } else {
                missing.push(shard);
            }
        }
        if !missing.is_empty() {
            return Err(LoaderError::MissingShards { missing });
        }
        return Ok(paths);
    }

    let files = find_safetensors_files(path)?;
    if files.is_empty() {
        return Err(LoaderError::NoSafetensorsFound {
            path: path.display().to_string(),
        });
    }
    Ok(files)
}

/// All `*.safetensors` files in `dir`, sorted
pub fn find_safetensors_files(dir: impl AsRef<Path>) -> LoadResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let io_err = |e| LoaderError::FileRead {
        path: dir.display().to_string(),
        source: e,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Deserialize a JSON file
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> LoadResult<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Information about a tensor (without the actual data)
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub dtype: safetensors::Dtype,
    pub shape: Vec<usize>,
}

/// Names, dtypes and shapes of every tensor in `paths`.
///
/// Files are memory mapped and only their headers are parsed; tensor data
/// is never paged in.
pub fn read_tensor_info(paths: &[PathBuf]) -> LoadResult<HashMap<String, TensorInfo>> {
    let mut info = HashMap::new();
    for path in paths {
        let mmaped = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
        for (name, view) in mmaped.tensors() {
            info.insert(
                name,
                TensorInfo {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                },
            );
        }
    }
    Ok(info)
}

/// Fingerprint computed from tensor headers only
pub fn fingerprint_from_info(info: &HashMap<String, TensorInfo>) -> String {
    hash_state_dict_keys(info.iter().map(|(k, v)| (k.as_str(), v.shape.as_slice())))
}

/// Outcome of copying checkpoint tensors into a model's variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Model variables left at their initial value
    pub initialized: Vec<String>,
    /// Checkpoint tensors the model has no variable for
    pub unexpected: Vec<String>,
}

/// Loads external checkpoints into a [`WanModel`]
pub struct CheckpointLoader {
    device: Device,
    dtype: DType,
    converter: StateDictConverter,
    strict: bool,
}

impl CheckpointLoader {
    pub fn new(device: Device, dtype: DType, converter: StateDictConverter) -> Self {
        Self {
            device,
            dtype,
            converter,
            strict: false,
        }
    }

    /// In strict mode every variable outside the adapter and clean-latent
    /// families must come from the checkpoint.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn converter(&self) -> &StateDictConverter {
        &self.converter
    }

    /// Read every tensor from `paths`, cast to the loader dtype
    pub fn load_state_dict(&self, paths: &[PathBuf]) -> LoadResult<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        for path in paths {
            let tensors = candle_core::safetensors::load(path, &self.device)?;
            for (name, t) in tensors {
                state_dict.insert(name, t.to_dtype(self.dtype)?);
            }
        }
        tracing::debug!(files = paths.len(), tensors = state_dict.len(), "state dict read");
        Ok(state_dict)
    }

    /// Resolve, read and convert a checkpoint
    pub fn load_converted(&self, path: impl AsRef<Path>) -> LoadResult<ConvertedStateDict> {
        let files = resolve_checkpoint_files(path)?;
        let state_dict = self.load_state_dict(&files)?;
        let converted = self.converter.convert(state_dict);
        tracing::info!(
            convention = %converted.convention,
            fingerprint = %converted.fingerprint,
            known = converted.config.is_some(),
            tensors = converted.tensors.len(),
            dropped = converted.dropped.len(),
            "checkpoint converted"
        );
        Ok(converted)
    }

    /// Build the model and copy `tensors` into its variables.
    ///
    /// Camera adapters start as zero encoder and identity projector; any of
    /// them present in `tensors` override those values.
    pub fn build_model(
        &self,
        config: &WanModelConfig,
        tensors: &HashMap<String, Tensor>,
    ) -> LoadResult<(WanModel, VarMap, LoadReport)> {
        config.validate()?;
        let mut varmap = VarMap::new();
        let model = WanModel::from_varmap(config, &varmap, self.dtype, &self.device)?;

        let names: Vec<String> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
            data.keys().cloned().collect()
        };

        let mut report = LoadReport::default();
        for name in &names {
            match tensors.get(name) {
                Some(t) => varmap.set_one(name, t.to_dtype(self.dtype)?)?,
                None => report.initialized.push(name.clone()),
            }
        }
        let known: HashSet<&str> = names.iter().map(String::as_str).collect();
        report.unexpected = tensors
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        report.initialized.sort();
        report.unexpected.sort();

        if self.strict {
            let missing: Vec<String> = report
                .initialized
                .iter()
                .filter(|n| !is_adapter_parameter(n))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(LoaderError::MissingTensors { missing });
            }
        }
        if !report.unexpected.is_empty() {
            tracing::warn!(count = report.unexpected.len(), "checkpoint tensors without a model variable");
        }
        tracing::info!(
            loaded = names.len() - report.initialized.len(),
            initialized = report.initialized.len(),
            "model weights loaded"
        );
        Ok((model, varmap, report))
    }
}

/// Parameters introduced on top of the base video DiT
pub fn is_adapter_parameter(name: &str) -> bool {
    name.contains(".cam_encoder.")
        || name.contains(".projector.")
        || name.starts_with("clean_x_embedder.")
        || name.contains("_processor.")
        || name.contains(".moe.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_shard_files() {
        let mut weight_map = HashMap::new();
        weight_map.insert("a".to_string(), "shard1.safetensors".to_string());
        weight_map.insert("b".to_string(), "shard1.safetensors".to_string());
        weight_map.insert("c".to_string(), "shard2.safetensors".to_string());
        let index = SafetensorsIndex {
            weight_map,
            metadata: None,
        };
        assert_eq!(
            index.shard_files(),
            vec!["shard1.safetensors".to_string(), "shard2.safetensors".to_string()]
        );
    }

    #[test]
    fn test_adapter_parameter_names() {
        assert!(is_adapter_parameter("blocks.3.cam_encoder.weight"));
        assert!(is_adapter_parameter("blocks.0.projector.bias"));
        assert!(is_adapter_parameter("clean_x_embedder.proj_4x.weight"));
        assert!(is_adapter_parameter("nuscenes_processor.projector.0.weight"));
        assert!(is_adapter_parameter("blocks.1.moe.experts.2.0.weight"));
        assert!(!is_adapter_parameter("blocks.0.self_attn.q.weight"));
        assert!(!is_adapter_parameter("head.modulation"));
    }
}
