//! Diffusion Transformer blocks for the ReCam video model
//!
//! - SelfAttention with QK RMSNorm and 3D RoPE
//! - CrossAttention over text context, optionally with a CLIP image branch
//! - DiTBlock with shift/scale/gate modulation and camera / expert fusion
//! - Head with two-way modulation
//! - Timestep, text and image embeddings

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};

use crate::common::attention::{AttentionConfig, CrossPlatformAttention};
use crate::common::norms::{AffineLayerNorm, LayerNormNoParams, RmsNorm};
use crate::common::precision::extended_precision;
use crate::config::WanModelConfig;
use crate::moe::{ExpertStatistics, MultiModalMoe, RouterDecision};
use crate::rope::{RopeFreqs, apply_rope};

/// Leading context tokens that carry CLIP image features
pub const IMAGE_CONTEXT_TOKENS: usize = 257;

/// `x * (1 + scale) + shift`
pub fn modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)
}

/// Square identity matrix
pub fn identity(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}

fn zero_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", candle_nn::init::ZERO)?;
    let bias = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(weight, Some(bias)))
}

// ===========================================================================
// Attention
// ===========================================================================

#[derive(Debug, Clone)]
pub struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    norm_q: RmsNorm,
    norm_k: RmsNorm,
    attn: CrossPlatformAttention,
}

impl SelfAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        eps: f64,
        use_accelerated: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            o: linear(dim, dim, vb.pp("o"))?,
            norm_q: RmsNorm::new(dim, eps, vb.pp("norm_q"))?,
            norm_k: RmsNorm::new(dim, eps, vb.pp("norm_k"))?,
            attn: CrossPlatformAttention::new(AttentionConfig {
                n_heads: num_heads,
                use_accelerated,
            }),
        })
    }

    pub fn forward(&self, x: &Tensor, freqs: &RopeFreqs) -> Result<Tensor> {
        let n = self.attn.num_heads();
        let q = self.norm_q.forward(&self.q.forward(x)?)?;
        let k = self.norm_k.forward(&self.k.forward(x)?)?;
        let v = self.v.forward(x)?;
        let q = apply_rope(&q, freqs, n)?;
        let k = apply_rope(&k, freqs, n)?;
        let out = self.attn.forward(&q, &k, &v)?;
        self.o.forward(&out)
    }
}

#[derive(Debug, Clone)]
struct ImageBranch {
    k_img: Linear,
    v_img: Linear,
    norm_k_img: RmsNorm,
}

#[derive(Debug, Clone)]
pub struct CrossAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    norm_q: RmsNorm,
    norm_k: RmsNorm,
    image: Option<ImageBranch>,
    attn: CrossPlatformAttention,
}

impl CrossAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        eps: f64,
        has_image_input: bool,
        use_accelerated: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let image = if has_image_input {
            Some(ImageBranch {
                k_img: linear(dim, dim, vb.pp("k_img"))?,
                v_img: linear(dim, dim, vb.pp("v_img"))?,
                norm_k_img: RmsNorm::new(dim, eps, vb.pp("norm_k_img"))?,
            })
        } else {
            None
        };
        Ok(Self {
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            o: linear(dim, dim, vb.pp("o"))?,
            norm_q: RmsNorm::new(dim, eps, vb.pp("norm_q"))?,
            norm_k: RmsNorm::new(dim, eps, vb.pp("norm_k"))?,
            image,
            attn: CrossPlatformAttention::new(AttentionConfig {
                n_heads: num_heads,
                use_accelerated,
            }),
        })
    }

    pub fn has_image_input(&self) -> bool {
        self.image.is_some()
    }

    pub fn forward(&self, x: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (text, image_ctx) = match &self.image {
            Some(_) => {
                let len = context.dim(1)?;
                if len < IMAGE_CONTEXT_TOKENS {
                    candle_core::bail!(
                        "image-conditioned cross attention needs at least {IMAGE_CONTEXT_TOKENS} context tokens, got {len}"
                    );
                }
                (
                    context.narrow(1, IMAGE_CONTEXT_TOKENS, len - IMAGE_CONTEXT_TOKENS)?,
                    Some(context.narrow(1, 0, IMAGE_CONTEXT_TOKENS)?),
                )
            }
            None => (context.clone(), None),
        };

        let q = self.norm_q.forward(&self.q.forward(x)?)?;
        let k = self.norm_k.forward(&self.k.forward(&text)?)?;
        let v = self.v.forward(&text)?;
        let mut out = self.attn.forward(&q, &k, &v)?;

        if let (Some(branch), Some(img)) = (&self.image, image_ctx) {
            let k_img = branch.norm_k_img.forward(&branch.k_img.forward(&img)?)?;
            let v_img = branch.v_img.forward(&img)?;
            out = (out + self.attn.forward(&q, &k_img, &v_img)?)?;
        }
        self.o.forward(&out)
    }
}

// ===========================================================================
// FeedForward Network
// ===========================================================================

/// Structure: ffn.0 Linear(dim → ffn_dim) → GELU(tanh) → ffn.2 Linear(ffn_dim → dim)
#[derive(Debug, Clone)]
pub struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj_in: linear(dim, ffn_dim, vb.pp("0"))?,
            proj_out: linear(ffn_dim, dim, vb.pp("2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.proj_out.forward(&self.proj_in.forward(x)?.gelu()?)
    }
}

// ===========================================================================
// DiT Block
// ===========================================================================

/// How a block injects side-channel conditioning, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// No camera or expert modules
    Plain,
    /// `cam_encoder` adds the camera embedding
    CameraFallback,
    /// Expert fusion, falling back to the camera encoder (if any) when no
    /// modality inputs reach the block
    MoeFusion,
}

#[derive(Debug, Clone)]
enum Fusion {
    Plain,
    Camera(Linear),
    Moe {
        moe: MultiModalMoe,
        camera: Option<Linear>,
    },
}

/// Expert inputs shared by all blocks of one pass
#[derive(Debug, Clone, Copy)]
pub struct MoeRouting<'a> {
    /// Sum of the processed modality embeddings `[B, S, unified_dim]`
    pub combined: &'a Tensor,
    pub decision: &'a RouterDecision,
}

/// Per-pass inputs lent to every block
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    /// `[B, 6, D]`
    pub t_mod: &'a Tensor,
    pub freqs: &'a RopeFreqs,
    pub context: Option<&'a Tensor>,
    /// `[B, S, cam_dim]`
    pub cam_emb: Option<&'a Tensor>,
    pub moe: Option<MoeRouting<'a>>,
}

#[derive(Debug, Clone)]
pub struct DiTBlock {
    self_attn: SelfAttention,
    cross_attn: CrossAttention,
    norm1: LayerNormNoParams,
    norm2: LayerNormNoParams,
    norm3: AffineLayerNorm,
    ffn: FeedForward,
    /// (1, 6, dim)
    modulation: Tensor,
    fusion: Fusion,
    /// Identity when camera adapters are disabled
    projector: Option<Linear>,
}

impl DiTBlock {
    pub fn new(cfg: &WanModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.dim;
        let accel = cfg.use_accelerated_attention;
        let self_attn = SelfAttention::new(dim, cfg.num_heads, cfg.eps, accel, vb.pp("self_attn"))?;
        let cross_attn = CrossAttention::new(
            dim,
            cfg.num_heads,
            cfg.eps,
            cfg.has_image_input,
            accel,
            vb.pp("cross_attn"),
        )?;
        let norm3 = AffineLayerNorm::new(dim, cfg.eps, vb.pp("norm3"))?;
        let ffn = FeedForward::new(dim, cfg.ffn_dim, vb.pp("ffn"))?;
        let modulation = vb.get_with_hints(
            (1, 6, dim),
            "modulation",
            candle_nn::init::Init::Randn {
                mean: 0.0,
                stdev: (dim as f64).powf(-0.5),
            },
        )?;

        let (camera, projector) = if cfg.camera.enabled {
            (
                Some(zero_linear(cfg.camera.cam_dim, dim, vb.pp("cam_encoder"))?),
                // Fresh projectors are set to identity by `WanModel::from_varmap`
                Some(zero_linear(dim, dim, vb.pp("projector"))?),
            )
        } else {
            (None, None)
        };
        let fusion = match (cfg.use_moe, camera) {
            (true, camera) => Fusion::Moe {
                moe: MultiModalMoe::new(&cfg.moe, dim, vb.pp("moe"))?,
                camera,
            },
            (false, Some(enc)) => Fusion::Camera(enc),
            (false, None) => Fusion::Plain,
        };

        Ok(Self {
            self_attn,
            cross_attn,
            norm1: LayerNormNoParams::new(cfg.eps),
            norm2: LayerNormNoParams::new(cfg.eps),
            norm3,
            ffn,
            modulation,
            fusion,
            projector,
        })
    }

    pub fn mode(&self) -> BlockMode {
        match self.fusion {
            Fusion::Plain => BlockMode::Plain,
            Fusion::Camera(_) => BlockMode::CameraFallback,
            Fusion::Moe { .. } => BlockMode::MoeFusion,
        }
    }

    pub fn moe(&self) -> Option<&MultiModalMoe> {
        match &self.fusion {
            Fusion::Moe { moe, .. } => Some(moe),
            _ => None,
        }
    }

    fn camera_term(encoder: Option<&Linear>, cam_emb: Option<&Tensor>) -> Result<Option<Tensor>> {
        match (encoder, cam_emb) {
            (Some(enc), Some(cam)) => {
                let cam = cam.to_dtype(enc.weight().dtype())?;
                Ok(Some(enc.forward(&cam)?))
            }
            _ => Ok(None),
        }
    }

    /// Returns the updated hidden state and, when expert fusion ran, its statistics.
    pub fn forward(
        &self,
        x: &Tensor,
        ctx: &BlockContext<'_>,
    ) -> Result<(Tensor, Option<ExpertStatistics>)> {
        let ada = self.modulation.broadcast_add(&ctx.t_mod.to_dtype(self.modulation.dtype())?)?;
        let ada = ada.to_dtype(x.dtype())?;
        let chunks = ada.chunk(6, 1)?;
        let (shift_msa, scale_msa, gate_msa) = (&chunks[0], &chunks[1], &chunks[2]);
        let (shift_mlp, scale_mlp, gate_mlp) = (&chunks[3], &chunks[4], &chunks[5]);

        let mut input_x = modulate(&self.norm1.forward(x)?, shift_msa, scale_msa)?;

        let mut stats = None;
        let fused = match &self.fusion {
            Fusion::Plain => None,
            Fusion::Camera(enc) => Self::camera_term(Some(enc), ctx.cam_emb)?,
            Fusion::Moe { moe, camera } => match ctx.moe {
                Some(routing) => {
                    let (out, s) = moe.forward(routing.combined, routing.decision)?;
                    stats = Some(s);
                    Some(out)
                }
                None => Self::camera_term(camera.as_ref(), ctx.cam_emb)?,
            },
        };
        if let Some(term) = fused {
            input_x = input_x.broadcast_add(&term.to_dtype(input_x.dtype())?)?;
        }

        let mut attn = self.self_attn.forward(&input_x, ctx.freqs)?;
        if let Some(projector) = &self.projector {
            attn = projector.forward(&attn)?;
        }
        let mut x = (x + attn.broadcast_mul(gate_msa)?)?;

        if let Some(context) = ctx.context {
            let normed = self.norm3.forward(&x)?;
            x = (&x + self.cross_attn.forward(&normed, context)?)?;
        }

        let ffn_in = modulate(&self.norm2.forward(&x)?, shift_mlp, scale_mlp)?;
        let x = (&x + self.ffn.forward(&ffn_in)?.broadcast_mul(gate_mlp)?)?;
        Ok((x, stats))
    }
}

// ===========================================================================
// Head
// ===========================================================================

#[derive(Debug, Clone)]
pub struct Head {
    norm: LayerNormNoParams,
    head: Linear,
    /// (1, 2, dim)
    modulation: Tensor,
}

impl Head {
    pub fn new(dim: usize, out_dim: usize, patch_size: [usize; 3], eps: f64, vb: VarBuilder) -> Result<Self> {
        let patch: usize = patch_size.iter().product();
        let modulation = vb.get_with_hints(
            (1, 2, dim),
            "modulation",
            candle_nn::init::Init::Randn {
                mean: 0.0,
                stdev: (dim as f64).powf(-0.5),
            },
        )?;
        Ok(Self {
            norm: LayerNormNoParams::new(eps),
            head: linear(dim, out_dim * patch, vb.pp("head"))?,
            modulation,
        })
    }

    /// `x`: `[B, L, D]`, `t`: `[B, D]`
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        let t = t.to_dtype(self.modulation.dtype())?.unsqueeze(1)?;
        let ada = self.modulation.broadcast_add(&t)?.to_dtype(x.dtype())?;
        let chunks = ada.chunk(2, 1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        let x = modulate(&self.norm.forward(x)?, shift, scale)?;
        self.head.forward(&x)
    }
}

// ===========================================================================
// Embeddings
// ===========================================================================

/// `[cos | sin]` of `position * 10000^(-k / half)`, computed in extended precision.
///
/// `position`: `[B]` → `[B, dim]` (f32)
pub fn sinusoidal_embedding_1d(dim: usize, position: &Tensor) -> Result<Tensor> {
    let half = dim / 2;
    let device = position.device();
    let dtype = extended_precision(device);
    let inv: Vec<f64> = (0..half)
        .map(|k| 10000f64.powf(-(k as f64) / half as f64))
        .collect();
    let inv = Tensor::from_vec(inv, (1, half), device)?.to_dtype(dtype)?;
    let pos = position.flatten_all()?.to_dtype(dtype)?.unsqueeze(1)?;
    let sinusoid = pos.broadcast_mul(&inv)?;
    Tensor::cat(&[sinusoid.cos()?, sinusoid.sin()?], D::Minus1)?.to_dtype(DType::F32)
}

/// time_embedding: Linear(freq_dim, dim) → SiLU → Linear(dim, dim)
/// time_projection: SiLU → Linear(dim, 6 * dim)
#[derive(Debug, Clone)]
pub struct TimeEmbedding {
    linear_1: Linear,
    linear_2: Linear,
    projection: Linear,
    freq_dim: usize,
    dim: usize,
}

impl TimeEmbedding {
    pub fn new(freq_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let vb_t = vb.pp("time_embedding");
        Ok(Self {
            linear_1: linear(freq_dim, dim, vb_t.pp("0"))?,
            linear_2: linear(dim, dim, vb_t.pp("2"))?,
            projection: linear(dim, 6 * dim, vb.pp("time_projection").pp("1"))?,
            freq_dim,
            dim,
        })
    }

    /// Returns `(t [B, D], t_mod [B, 6, D])`.
    pub fn forward(&self, timestep: &Tensor) -> Result<(Tensor, Tensor)> {
        let emb = sinusoidal_embedding_1d(self.freq_dim, timestep)?
            .to_dtype(self.linear_1.weight().dtype())?;
        let t = self.linear_2.forward(&self.linear_1.forward(&emb)?.silu()?)?;
        let t_mod = self.projection.forward(&t.silu()?)?;
        let b = t_mod.dim(0)?;
        Ok((t, t_mod.reshape((b, 6, self.dim))?))
    }
}

/// text_embedding: Linear(text_dim, dim) → GELU(tanh) → Linear(dim, dim)
#[derive(Debug, Clone)]
pub struct TextEmbedding {
    linear_1: Linear,
    linear_2: Linear,
}

impl TextEmbedding {
    pub fn new(text_dim: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: linear(text_dim, dim, vb.pp("0"))?,
            linear_2: linear(dim, dim, vb.pp("2"))?,
        })
    }
}

impl Module for TextEmbedding {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(self.linear_1.weight().dtype())?;
        self.linear_2.forward(&self.linear_1.forward(&x)?.gelu()?)
    }
}

/// CLIP feature projection for image-to-video:
/// LayerNorm → Linear → GELU → Linear → LayerNorm
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    norm_in: AffineLayerNorm,
    linear_1: Linear,
    linear_2: Linear,
    norm_out: AffineLayerNorm,
}

pub const CLIP_FEATURE_DIM: usize = 1280;

impl ImageEmbedding {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("proj");
        Ok(Self {
            norm_in: AffineLayerNorm::new(CLIP_FEATURE_DIM, 1e-5, vb.pp("0"))?,
            linear_1: linear(CLIP_FEATURE_DIM, CLIP_FEATURE_DIM, vb.pp("1"))?,
            linear_2: linear(CLIP_FEATURE_DIM, dim, vb.pp("3"))?,
            norm_out: AffineLayerNorm::new(dim, 1e-5, vb.pp("4"))?,
        })
    }
}

impl Module for ImageEmbedding {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(self.linear_1.weight().dtype())?;
        let x = self.linear_1.forward(&self.norm_in.forward(&x)?)?.gelu_erf()?;
        self.norm_out.forward(&self.linear_2.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_sinusoidal_embedding_at_zero() -> Result<()> {
        let t = Tensor::new(&[0f32], &Device::Cpu)?;
        let emb = sinusoidal_embedding_1d(8, &t)?.to_vec2::<f32>()?;
        assert_eq!(emb[0], vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_identity_matrix() -> Result<()> {
        let eye = identity(3, DType::F32, &Device::Cpu)?;
        assert_eq!(
            eye.to_vec2::<f32>()?,
            vec![vec![1., 0., 0.], vec![0., 1., 0.], vec![0., 0., 1.]]
        );
        Ok(())
    }

    #[test]
    fn test_cross_attention_requires_image_tokens() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = CrossAttention::new(16, 2, 1e-6, true, false, vb)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device)?;
        let short = Tensor::randn(0f32, 1.0, (1, 100, 16), &device)?;
        assert!(attn.forward(&x, &short).is_err());
        let full = Tensor::randn(0f32, 1.0, (1, IMAGE_CONTEXT_TOKENS + 3, 16), &device)?;
        assert_eq!(attn.forward(&x, &full)?.dims(), &[1, 4, 16]);
        Ok(())
    }

    #[test]
    fn test_block_modes() -> Result<()> {
        let device = Device::Cpu;
        let base = WanModelConfig {
            dim: 16,
            ffn_dim: 32,
            num_heads: 2,
            num_layers: 1,
            ..Default::default()
        };
        let build = |cfg: &WanModelConfig| -> Result<BlockMode> {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            Ok(DiTBlock::new(cfg, vb)?.mode())
        };
        assert_eq!(build(&base)?, BlockMode::CameraFallback);

        let mut plain = base.clone();
        plain.camera.enabled = false;
        assert_eq!(build(&plain)?, BlockMode::Plain);

        let mut moe = base.clone();
        moe.use_moe = true;
        assert_eq!(build(&moe)?, BlockMode::MoeFusion);
        Ok(())
    }

    #[test]
    fn test_head_output_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = Head::new(16, 4, [1, 2, 2], 1e-6, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let t = Tensor::randn(0f32, 1.0, (2, 16), &device)?;
        assert_eq!(head.forward(&x, &t)?.dims(), &[2, 5, 16]);
        Ok(())
    }
}
