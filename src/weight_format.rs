//! Checkpoint conventions, key renaming and architecture fingerprints.
//!
//! Two external layouts are understood:
//! - Diffusers: `condition_embedder.*`, `blocks.{i}.attn1.to_q.*`, `proj_out.*`
//! - Civitai: already uses the internal names (`blocks.{i}.self_attn.q.*`)
//!
//! The architecture of a checkpoint is recovered from the md5 of its key and
//! shape listing, looked up in a JSON registry.

use std::collections::HashMap;

use candle_core::Tensor;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::config::WanModelConfig;

const EMBEDDED_FINGERPRINTS: &str = include_str!("../resources/fingerprints.json");

/// Naming convention of a state dict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    Diffusers,
    Civitai,
}

impl std::fmt::Display for Convention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Convention::Diffusers => write!(f, "diffusers"),
            Convention::Civitai => write!(f, "civitai"),
        }
    }
}

/// Detect the convention from parameter names
pub fn detect_convention<'a>(keys: impl IntoIterator<Item = &'a str>) -> Convention {
    let diffusers = keys
        .into_iter()
        .any(|k| k.starts_with("condition_embedder.") || k.contains(".attn1."));
    if diffusers {
        Convention::Diffusers
    } else {
        Convention::Civitai
    }
}

/// md5 over the sorted, comma-joined `name:d0_d1_...` and `name` entries
pub fn hash_state_dict_keys<'a>(entries: impl IntoIterator<Item = (&'a str, &'a [usize])>) -> String {
    let mut keys = Vec::new();
    for (name, shape) in entries {
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        keys.push(format!("{name}:{}", dims.join("_")));
        keys.push(name.to_string());
    }
    keys.sort();
    let digest = Md5::digest(keys.join(",").as_bytes());
    format!("{digest:x}")
}

/// Fingerprint of a loaded state dict
pub fn fingerprint(state_dict: &HashMap<String, Tensor>) -> String {
    hash_state_dict_keys(state_dict.iter().map(|(k, t)| (k.as_str(), t.dims())))
}

/// Architecture recorded for a known checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_image_input: Option<bool>,
    pub patch_size: [usize; 3],
    pub in_dim: usize,
    pub dim: usize,
    pub ffn_dim: usize,
    pub freq_dim: usize,
    pub text_dim: usize,
    pub out_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub eps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<[i64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qk_norm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_attn_norm: Option<bool>,
}

impl ArchitectureConfig {
    /// Overlay the recorded architecture on `base`, keeping its MoE,
    /// camera and processor settings.
    pub fn apply_to(&self, base: WanModelConfig) -> WanModelConfig {
        WanModelConfig {
            dim: self.dim,
            in_dim: self.in_dim,
            ffn_dim: self.ffn_dim,
            out_dim: self.out_dim,
            text_dim: self.text_dim,
            freq_dim: self.freq_dim,
            eps: self.eps,
            patch_size: self.patch_size,
            num_heads: self.num_heads,
            num_layers: self.num_layers,
            has_image_input: self.has_image_input.unwrap_or(base.has_image_input),
            ..base
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryEntry {
    fingerprint: String,
    convention: Convention,
    config: ArchitectureConfig,
}

/// Fingerprint → architecture lookup
#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    entries: HashMap<(Convention, String), ArchitectureConfig>,
}

impl FingerprintRegistry {
    /// Registry of the known Wan checkpoints
    pub fn embedded() -> Result<Self, serde_json::Error> {
        Self::from_json(EMBEDDED_FINGERPRINTS)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let list: Vec<RegistryEntry> = serde_json::from_str(json)?;
        let mut registry = Self::default();
        for e in list {
            registry.insert(e.convention, e.fingerprint, e.config);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, convention: Convention, fingerprint: String, config: ArchitectureConfig) {
        self.entries.insert((convention, fingerprint), config);
    }

    pub fn lookup(&self, convention: Convention, fingerprint: &str) -> Option<&ArchitectureConfig> {
        self.entries.get(&(convention, fingerprint.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of converting a state dict to internal names
#[derive(Debug)]
pub struct ConvertedStateDict {
    pub tensors: HashMap<String, Tensor>,
    pub convention: Convention,
    pub fingerprint: String,
    /// `None` when the fingerprint is not registered
    pub config: Option<ArchitectureConfig>,
    /// Source keys with no internal counterpart
    pub dropped: Vec<String>,
}

/// Renames external checkpoints to the internal parameter layout
pub struct StateDictConverter {
    diffusers_map: HashMap<&'static str, &'static str>,
    registry: FingerprintRegistry,
}

impl StateDictConverter {
    pub fn new(registry: FingerprintRegistry) -> Self {
        // Per-block entries are written for block 0 and applied to every index.
        let diffusers_map: HashMap<&'static str, &'static str> = [
            ("blocks.0.attn1.norm_k.weight", "blocks.0.self_attn.norm_k.weight"),
            ("blocks.0.attn1.norm_q.weight", "blocks.0.self_attn.norm_q.weight"),
            ("blocks.0.attn1.to_k.bias", "blocks.0.self_attn.k.bias"),
            ("blocks.0.attn1.to_k.weight", "blocks.0.self_attn.k.weight"),
            ("blocks.0.attn1.to_out.0.bias", "blocks.0.self_attn.o.bias"),
            ("blocks.0.attn1.to_out.0.weight", "blocks.0.self_attn.o.weight"),
            ("blocks.0.attn1.to_q.bias", "blocks.0.self_attn.q.bias"),
            ("blocks.0.attn1.to_q.weight", "blocks.0.self_attn.q.weight"),
            ("blocks.0.attn1.to_v.bias", "blocks.0.self_attn.v.bias"),
            ("blocks.0.attn1.to_v.weight", "blocks.0.self_attn.v.weight"),
            ("blocks.0.attn2.norm_k.weight", "blocks.0.cross_attn.norm_k.weight"),
            ("blocks.0.attn2.norm_q.weight", "blocks.0.cross_attn.norm_q.weight"),
            ("blocks.0.attn2.to_k.bias", "blocks.0.cross_attn.k.bias"),
            ("blocks.0.attn2.to_k.weight", "blocks.0.cross_attn.k.weight"),
            ("blocks.0.attn2.to_out.0.bias", "blocks.0.cross_attn.o.bias"),
            ("blocks.0.attn2.to_out.0.weight", "blocks.0.cross_attn.o.weight"),
            ("blocks.0.attn2.to_q.bias", "blocks.0.cross_attn.q.bias"),
            ("blocks.0.attn2.to_q.weight", "blocks.0.cross_attn.q.weight"),
            ("blocks.0.attn2.to_v.bias", "blocks.0.cross_attn.v.bias"),
            ("blocks.0.attn2.to_v.weight", "blocks.0.cross_attn.v.weight"),
            ("blocks.0.ffn.net.0.proj.bias", "blocks.0.ffn.0.bias"),
            ("blocks.0.ffn.net.0.proj.weight", "blocks.0.ffn.0.weight"),
            ("blocks.0.ffn.net.2.bias", "blocks.0.ffn.2.bias"),
            ("blocks.0.ffn.net.2.weight", "blocks.0.ffn.2.weight"),
            ("blocks.0.norm2.bias", "blocks.0.norm3.bias"),
            ("blocks.0.norm2.weight", "blocks.0.norm3.weight"),
            ("blocks.0.scale_shift_table", "blocks.0.modulation"),
            ("condition_embedder.text_embedder.linear_1.bias", "text_embedding.0.bias"),
            ("condition_embedder.text_embedder.linear_1.weight", "text_embedding.0.weight"),
            ("condition_embedder.text_embedder.linear_2.bias", "text_embedding.2.bias"),
            ("condition_embedder.text_embedder.linear_2.weight", "text_embedding.2.weight"),
            ("condition_embedder.time_embedder.linear_1.bias", "time_embedding.0.bias"),
            ("condition_embedder.time_embedder.linear_1.weight", "time_embedding.0.weight"),
            ("condition_embedder.time_embedder.linear_2.bias", "time_embedding.2.bias"),
            ("condition_embedder.time_embedder.linear_2.weight", "time_embedding.2.weight"),
            ("condition_embedder.time_proj.bias", "time_projection.1.bias"),
            ("condition_embedder.time_proj.weight", "time_projection.1.weight"),
            ("patch_embedding.bias", "patch_embedding.bias"),
            ("patch_embedding.weight", "patch_embedding.weight"),
            ("scale_shift_table", "head.modulation"),
            ("proj_out.bias", "head.head.bias"),
            ("proj_out.weight", "head.head.weight"),
        ]
        .into_iter()
        .collect();

        Self {
            diffusers_map,
            registry,
        }
    }

    /// Converter backed by the embedded registry
    pub fn with_embedded_registry() -> Result<Self, serde_json::Error> {
        Ok(Self::new(FingerprintRegistry::embedded()?))
    }

    pub fn registry(&self) -> &FingerprintRegistry {
        &self.registry
    }

    /// Internal name for a diffusers key, or `None` if it has no counterpart.
    ///
    /// Exact matches win; otherwise the second path segment is replaced by
    /// `0`, looked up, and restored in the mapped name.
    pub fn rename_diffusers_key(&self, name: &str) -> Option<String> {
        if let Some(mapped) = self.diffusers_map.get(name) {
            return Some((*mapped).to_string());
        }
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < 2 {
            return None;
        }
        let mut templated = parts.clone();
        templated[1] = "0";
        let mapped = self.diffusers_map.get(templated.join(".").as_str())?;
        let mut out: Vec<&str> = mapped.split('.').collect();
        if out.len() < 2 {
            return None;
        }
        out[1] = parts[1];
        Some(out.join("."))
    }

    pub fn from_diffusers(&self, state_dict: HashMap<String, Tensor>) -> ConvertedStateDict {
        let fp = fingerprint(&state_dict);
        let config = self.registry.lookup(Convention::Diffusers, &fp).cloned();
        let mut tensors = HashMap::with_capacity(state_dict.len());
        let mut dropped = Vec::new();
        for (name, tensor) in state_dict {
            match self.rename_diffusers_key(&name) {
                Some(new_name) => {
                    tensors.insert(new_name, tensor);
                }
                None => dropped.push(name),
            }
        }
        dropped.sort();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "diffusers keys without an internal name");
        }
        ConvertedStateDict {
            tensors,
            convention: Convention::Diffusers,
            fingerprint: fp,
            config,
            dropped,
        }
    }

    pub fn from_civitai(&self, state_dict: HashMap<String, Tensor>) -> ConvertedStateDict {
        let fp = fingerprint(&state_dict);
        let config = self.registry.lookup(Convention::Civitai, &fp).cloned();
        ConvertedStateDict {
            tensors: state_dict,
            convention: Convention::Civitai,
            fingerprint: fp,
            config,
            dropped: Vec::new(),
        }
    }

    /// Detect the convention and convert
    pub fn convert(&self, state_dict: HashMap<String, Tensor>) -> ConvertedStateDict {
        match detect_convention(state_dict.keys().map(String::as_str)) {
            Convention::Diffusers => self.from_diffusers(state_dict),
            Convention::Civitai => self.from_civitai(state_dict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn converter() -> StateDictConverter {
        StateDictConverter::with_embedded_registry().unwrap()
    }

    #[test]
    fn test_rename_block_keys() {
        let c = converter();
        assert_eq!(
            c.rename_diffusers_key("blocks.0.attn1.to_q.weight").as_deref(),
            Some("blocks.0.self_attn.q.weight")
        );
        assert_eq!(
            c.rename_diffusers_key("blocks.17.attn2.to_out.0.bias").as_deref(),
            Some("blocks.17.cross_attn.o.bias")
        );
        assert_eq!(
            c.rename_diffusers_key("blocks.3.ffn.net.0.proj.weight").as_deref(),
            Some("blocks.3.ffn.0.weight")
        );
        assert_eq!(
            c.rename_diffusers_key("blocks.29.norm2.weight").as_deref(),
            Some("blocks.29.norm3.weight")
        );
    }

    #[test]
    fn test_rename_top_level_keys() {
        let c = converter();
        assert_eq!(
            c.rename_diffusers_key("scale_shift_table").as_deref(),
            Some("head.modulation")
        );
        assert_eq!(
            c.rename_diffusers_key("condition_embedder.time_proj.weight").as_deref(),
            Some("time_projection.1.weight")
        );
        assert_eq!(c.rename_diffusers_key("rope.freqs"), None);
        assert_eq!(c.rename_diffusers_key("unknown"), None);
    }

    #[test]
    fn test_hash_matches_reference_listing() {
        let entries: [(&str, &[usize]); 3] = [
            ("head.modulation", &[1, 2, 4]),
            ("blocks.0.ffn.0.weight", &[8, 4]),
            ("scalar", &[]),
        ];
        assert_eq!(
            hash_state_dict_keys(entries),
            "3dd93c547721d057a5617206ce89bdc7"
        );
    }

    #[test]
    fn test_embedded_registry_entries() {
        let registry = FingerprintRegistry::embedded().unwrap();
        assert_eq!(registry.len(), 4);
        let cfg = registry
            .lookup(Convention::Civitai, "6bfcfb3b342cb286ce886889d519a77e")
            .unwrap();
        assert_eq!(cfg.in_dim, 36);
        assert_eq!(cfg.has_image_input, Some(true));
        let model = cfg.apply_to(WanModelConfig::default());
        assert!((model.eps - 1e-6).abs() < 1e-12);
        let model = WanModelConfig { eps: 1e-6, ..model };
        assert_eq!(model, WanModelConfig::i2v_14b());
        assert!(
            registry
                .lookup(Convention::Diffusers, "6bfcfb3b342cb286ce886889d519a77e")
                .is_none()
        );
    }

    #[test]
    fn test_unknown_fingerprint_has_no_config() {
        let dev = Device::Cpu;
        let mut sd = HashMap::new();
        sd.insert(
            "condition_embedder.time_proj.weight".to_string(),
            Tensor::zeros((6, 2), DType::F32, &dev).unwrap(),
        );
        sd.insert(
            "blocks.1.attn1.to_q.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &dev).unwrap(),
        );
        sd.insert(
            "rope.freqs".to_string(),
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
        );
        let out = converter().convert(sd);
        assert_eq!(out.convention, Convention::Diffusers);
        assert!(out.config.is_none());
        assert!(out.tensors.contains_key("time_projection.1.weight"));
        assert!(out.tensors.contains_key("blocks.1.self_attn.q.weight"));
        assert_eq!(out.dropped, vec!["rope.freqs".to_string()]);
    }
}
