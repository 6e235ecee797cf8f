//! Configuration structures for the ReCam video DiT
//!
//! Every struct here deserializes from JSON with `serde`; missing optional
//! sections fall back to their `Default` implementation.

use serde::{Deserialize, Serialize};

/// Errors raised by configuration validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("dim {dim} is not divisible by num_heads {num_heads}")]
    HeadsDoNotDivideDim { dim: usize, num_heads: usize },

    #[error("head dimension {0} must be even to pair rotary channels")]
    OddHeadDim(usize),

    #[error("patch size {0:?} contains a zero extent")]
    ZeroPatch([usize; 3]),

    #[error("moe top_k {top_k} exceeds num_experts {num_experts}")]
    TopKExceedsExperts { top_k: usize, num_experts: usize },

    #[error("moe requires at least one expert and top_k >= 1")]
    EmptyMoe,

    #[error("modality processor '{0}' is registered more than once")]
    DuplicateProcessor(String),

    #[error("num_layers must be at least 1")]
    NoLayers,
}

/// Mixture-of-experts configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Width of the unified modality embedding fed to every expert
    pub unified_dim: usize,
    /// Number of expert linears per block
    pub num_experts: usize,
    /// Routed slots combined per token
    pub top_k: usize,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            unified_dim: 30,
            num_experts: 4,
            top_k: 2,
        }
    }
}

/// Camera-conditioning adapters attached to every block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Build `cam_encoder` / `projector` in each block
    pub enabled: bool,
    /// Flattened relative pose width (3x4)
    pub cam_dim: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cam_dim: 12,
        }
    }
}

/// A side-channel modality projected into the unified MoE dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityProcessorConfig {
    /// Modality label, e.g. `sekai`, `nuscenes`, `openx`
    pub name: String,
    /// Width of the raw modality embedding
    pub input_dim: usize,
}

/// Full model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WanModelConfig {
    /// Hidden dimension
    pub dim: usize,
    /// Latent channels entering the patch embedding
    pub in_dim: usize,
    /// FFN hidden dimension
    pub ffn_dim: usize,
    /// Latent channels produced by the head
    pub out_dim: usize,
    /// Text encoder width (umT5-XXL: 4096)
    pub text_dim: usize,
    /// Sinusoidal timestep embedding width
    pub freq_dim: usize,
    /// Epsilon shared by every norm
    pub eps: f64,
    /// Patch extent `(t, h, w)`
    pub patch_size: [usize; 3],
    pub num_heads: usize,
    pub num_layers: usize,
    /// Cross-attention splits 257 CLIP tokens off the context
    #[serde(default)]
    pub has_image_input: bool,
    /// Enable modality expert fusion in every block
    #[serde(default)]
    pub use_moe: bool,
    #[serde(default)]
    pub moe: MoeConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    /// Registered modality processors, in registration order
    #[serde(default)]
    pub modality_processors: Vec<ModalityProcessorConfig>,
    /// Build the 1x/2x/4x clean latent embedders
    #[serde(default = "default_true")]
    pub use_clean_latents: bool,
    /// Channels of the clean latents (VAE latent width)
    #[serde(default = "default_clean_latent_channels")]
    pub clean_latent_channels: usize,
    /// Maximum position addressed by the rotary tables
    #[serde(default = "default_rope_max_positions")]
    pub rope_max_positions: usize,
    /// Use Flash-Attn / SDPA when the device provides them
    #[serde(default = "default_true")]
    pub use_accelerated_attention: bool,
}

fn default_true() -> bool {
    true
}

fn default_clean_latent_channels() -> usize {
    16
}

fn default_rope_max_positions() -> usize {
    1024
}

impl Default for WanModelConfig {
    fn default() -> Self {
        Self::t2v_1_3b()
    }
}

impl WanModelConfig {
    /// Wan 1.3B text-to-video
    pub fn t2v_1_3b() -> Self {
        Self {
            dim: 1536,
            in_dim: 16,
            ffn_dim: 8960,
            out_dim: 16,
            text_dim: 4096,
            freq_dim: 256,
            eps: 1e-6,
            patch_size: [1, 2, 2],
            num_heads: 12,
            num_layers: 30,
            has_image_input: false,
            use_moe: false,
            moe: MoeConfig::default(),
            camera: CameraConfig::default(),
            modality_processors: Vec::new(),
            use_clean_latents: true,
            clean_latent_channels: 16,
            rope_max_positions: 1024,
            use_accelerated_attention: true,
        }
    }

    /// Wan 14B text-to-video
    pub fn t2v_14b() -> Self {
        Self {
            dim: 5120,
            ffn_dim: 13824,
            num_heads: 40,
            num_layers: 40,
            ..Self::t2v_1_3b()
        }
    }

    /// Wan 14B image-to-video (CLIP context, image latents concatenated)
    pub fn i2v_14b() -> Self {
        Self {
            in_dim: 36,
            has_image_input: true,
            ..Self::t2v_14b()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_heads == 0 || self.dim % self.num_heads != 0 {
            return Err(ConfigError::HeadsDoNotDivideDim {
                dim: self.dim,
                num_heads: self.num_heads,
            });
        }
        if self.head_dim() % 2 != 0 {
            return Err(ConfigError::OddHeadDim(self.head_dim()));
        }
        if self.patch_size.contains(&0) {
            return Err(ConfigError::ZeroPatch(self.patch_size));
        }
        if self.num_layers == 0 {
            return Err(ConfigError::NoLayers);
        }
        if self.use_moe {
            if self.moe.num_experts == 0 || self.moe.top_k == 0 {
                return Err(ConfigError::EmptyMoe);
            }
            if self.moe.top_k > self.moe.num_experts {
                return Err(ConfigError::TopKExceedsExperts {
                    top_k: self.moe.top_k,
                    num_experts: self.moe.num_experts,
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.modality_processors {
            if !seen.insert(p.name.as_str()) {
                return Err(ConfigError::DuplicateProcessor(p.name.clone()));
            }
        }
        Ok(())
    }
}

/// Flow-matching schedule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMatchConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    pub shift: f64,
    pub sigma_max: f64,
    pub sigma_min: f64,
    /// Drop the terminal sigma from `linspace(sigma_max, sigma_min, n + 1)`
    pub extra_one_step: bool,
}

fn default_num_train_timesteps() -> usize {
    1000
}

impl Default for FlowMatchConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 5.0,
            sigma_max: 1.0,
            sigma_min: 0.0,
            extra_one_step: true,
        }
    }
}

/// ReCam fine-tuning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub learning_rate: f64,
    /// Leading latent frames that are denoised and scored
    pub target_frames: usize,
    /// Trailing latent frames kept clean as conditioning
    pub condition_frames: usize,
    /// Latents larger than this are centre-cropped
    pub max_latent_height: usize,
    pub max_latent_width: usize,
    /// Parameter names containing any of these are optimized
    pub trainable_keywords: Vec<String>,
    #[serde(default)]
    pub use_gradient_checkpointing: bool,
    #[serde(default)]
    pub use_gradient_checkpointing_offload: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            target_frames: 5,
            condition_frames: 10,
            max_latent_height: 40,
            max_latent_width: 70,
            trainable_keywords: vec![
                "cam_encoder".to_string(),
                "projector".to_string(),
                "self_attn".to_string(),
            ],
            use_gradient_checkpointing: true,
            use_gradient_checkpointing_offload: false,
            seed: 0,
        }
    }
}
