//! Top-level ReCam video DiT
//!
//! Forward pass: modality processing → multi-scale token assembly → time and
//! text embeddings → one router decision → DiT blocks → head → unpatchify.

use std::collections::HashSet;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::assembler::{
    AssemblyInputs, CleanLatentEmbedder, CleanLatentInput, MultiScaleTokenAssembler,
    PatchEmbedding, unpatchify,
};
use crate::config::WanModelConfig;
use crate::dit::{
    BlockContext, DiTBlock, Head, ImageEmbedding, MoeRouting, TextEmbedding, TimeEmbedding,
    identity,
};
use crate::moe::{
    ExpertStatistics, ModalityExpertMap, ModalityProcessor, RouterDecision, combine_modalities,
    route,
};
use crate::rope::RotaryFrequencyTable;

/// Optional forward inputs
#[derive(Debug, Clone, Default)]
pub struct ForwardInputs<'a> {
    /// Text encoder output `[B, L, text_dim]`
    pub context: Option<&'a Tensor>,
    /// Relative camera poses `[B, frames, cam_dim]`
    pub cam_emb: Option<&'a Tensor>,
    pub latent_indices: Option<&'a Tensor>,
    pub clean_1x: Option<CleanLatentInput<'a>>,
    pub clean_2x: Option<CleanLatentInput<'a>>,
    pub clean_4x: Option<CleanLatentInput<'a>>,
    /// Modality label → raw embedding, in insertion order; the last entry is
    /// the active modality
    pub modality_inputs: Vec<(&'a str, &'a Tensor)>,
    /// CLIP image features `[B, 257, 1280]` (image-to-video only)
    pub clip_feature: Option<&'a Tensor>,
    /// Image latents concatenated to the input channels (image-to-video only)
    pub y: Option<&'a Tensor>,
    pub use_gradient_checkpointing: bool,
    pub use_gradient_checkpointing_offload: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStats {
    pub block: usize,
    pub stats: ExpertStatistics,
}

/// Diagnostics gathered during one forward pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardStats {
    pub blocks: Vec<BlockStats>,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[B, out_dim, T, H, W]`
    pub prediction: Tensor,
    /// Scalar, zero for the deterministic router
    pub specialization_loss: Tensor,
    pub router: Option<RouterDecision>,
    pub stats: ForwardStats,
}

pub struct WanModel {
    config: WanModelConfig,
    assembler: MultiScaleTokenAssembler,
    text_embedding: TextEmbedding,
    time_embedding: TimeEmbedding,
    img_emb: Option<ImageEmbedding>,
    blocks: Vec<DiTBlock>,
    head: Head,
    rope: RotaryFrequencyTable,
    experts: ModalityExpertMap,
    processors: Vec<ModalityProcessor>,
}

impl WanModel {
    /// Build the model from a fresh or partially filled [`VarMap`].
    ///
    /// Camera adapters created here start as a zero `cam_encoder` and an
    /// identity `projector`; adapter variables already in `varmap` keep their
    /// values.
    pub fn from_varmap(
        config: &WanModelConfig,
        varmap: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let existing: HashSet<String> = {
            let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
            data.keys().cloned().collect()
        };
        let model = Self::new(config, VarBuilder::from_varmap(varmap, dtype, device))?;
        init_camera_adapters(varmap, config, &existing)?;
        Ok(model)
    }

    /// Build the model with every variable read from `vb`.
    ///
    /// Meant for checkpoint-backed builders. The camera adapters have no
    /// identity initializer in [`VarBuilder`], so fresh models go through
    /// [`WanModel::from_varmap`].
    pub fn new(config: &WanModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;
        let dim = config.dim;

        let patch_embedding = PatchEmbedding::new(
            config.in_dim,
            dim,
            config.patch_size,
            vb.pp("patch_embedding"),
        )?;
        let clean_x_embedder = if config.use_clean_latents {
            Some(CleanLatentEmbedder::new(
                config.clean_latent_channels,
                dim,
                vb.pp("clean_x_embedder"),
            )?)
        } else {
            None
        };

        let text_embedding = TextEmbedding::new(config.text_dim, dim, vb.pp("text_embedding"))?;
        let time_embedding = TimeEmbedding::new(config.freq_dim, dim, vb.clone())?;
        let img_emb = if config.has_image_input {
            Some(ImageEmbedding::new(dim, vb.pp("img_emb"))?)
        } else {
            None
        };

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..config.num_layers)
            .map(|i| DiTBlock::new(config, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let head = Head::new(dim, config.out_dim, config.patch_size, config.eps, vb.pp("head"))?;

        let processors = config
            .modality_processors
            .iter()
            .map(|p| {
                ModalityProcessor::new(
                    &p.name,
                    p.input_dim,
                    config.moe.unified_dim,
                    vb.pp(format!("{}_processor", p.name)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let rope = RotaryFrequencyTable::new(config.head_dim(), config.rope_max_positions, vb.device())?;

        tracing::info!(
            dim,
            layers = config.num_layers,
            heads = config.num_heads,
            use_moe = config.use_moe,
            camera_adapters = config.camera.enabled,
            "constructed video DiT"
        );

        Ok(Self {
            config: config.clone(),
            assembler: MultiScaleTokenAssembler::new(patch_embedding, clean_x_embedder),
            text_embedding,
            time_embedding,
            img_emb,
            blocks,
            head,
            rope,
            experts: ModalityExpertMap::default(),
            processors,
        })
    }

    pub fn config(&self) -> &WanModelConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[DiTBlock] {
        &self.blocks
    }

    pub fn rope(&self) -> &RotaryFrequencyTable {
        &self.rope
    }

    pub fn assembler(&self) -> &MultiScaleTokenAssembler {
        &self.assembler
    }

    pub fn modality_experts(&self) -> &ModalityExpertMap {
        &self.experts
    }

    /// Run each registered processor on its modality; unregistered labels are skipped.
    pub fn process_modality_inputs(
        &self,
        inputs: &[(&str, &Tensor)],
    ) -> Result<Vec<(String, Tensor)>> {
        let mut processed = Vec::with_capacity(inputs.len());
        for (label, x) in inputs {
            match self.processors.iter().find(|p| p.name() == *label) {
                Some(p) => processed.push((label.to_string(), p.forward(x)?)),
                None => tracing::warn!(modality = *label, "no processor registered, input skipped"),
            }
        }
        Ok(processed)
    }

    /// Text context, with projected CLIP tokens prepended for image-to-video.
    fn embed_context(&self, inputs: &ForwardInputs<'_>) -> Result<Option<Tensor>> {
        let Some(context) = inputs.context else {
            return Ok(None);
        };
        let text = self.text_embedding.forward(context)?;
        match (&self.img_emb, inputs.clip_feature) {
            (Some(img_emb), Some(clip)) => {
                let clip = img_emb.forward(clip)?.to_dtype(text.dtype())?;
                Ok(Some(Tensor::cat(&[&clip, &text], 1)?))
            }
            _ => Ok(Some(text)),
        }
    }

    /// `latents`: `[B, in_dim, T, H, W]`, `timestep`: `[B]`
    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: &Tensor,
        inputs: &ForwardInputs<'_>,
    ) -> Result<ModelOutput> {
        let x = match inputs.y {
            Some(y) => Tensor::cat(&[latents, &y.to_dtype(latents.dtype())?], 1)?,
            None => latents.clone(),
        };

        let processed = if self.config.use_moe && !inputs.modality_inputs.is_empty() {
            self.process_modality_inputs(&inputs.modality_inputs)?
        } else {
            Vec::new()
        };
        let cam_source = match processed.last() {
            Some((_, t)) => Some(t),
            None => inputs.cam_emb,
        };

        let assembled = self.assembler.assemble(
            &x,
            &self.rope,
            &AssemblyInputs {
                latent_indices: inputs.latent_indices,
                clean_1x: inputs.clean_1x,
                clean_2x: inputs.clean_2x,
                clean_4x: inputs.clean_4x,
                cam_emb: cam_source,
            },
        )?;
        let grid = assembled.grid;
        let original_context_length = grid.tokens();
        let (b, seq_len, _) = assembled.tokens.dims3()?;

        let context = self.embed_context(inputs)?;
        let (t, t_mod) = self.time_embedding.forward(timestep)?;
        if t.dim(0)? != b && t.dim(0)? != 1 {
            candle_core::bail!("timestep batch {} does not match latent batch {b}", t.dim(0)?);
        }

        let rope_len = assembled.freqs.seq_len()?;
        if rope_len != seq_len {
            candle_core::bail!(
                "rotary frequencies cover {rope_len} positions but the sequence has {seq_len} tokens"
            );
        }

        // Every registered modality is replaced by the assembled embedding,
        // so the combined input is that embedding summed once per label.
        let mut combined = None;
        let mut decision = None;
        if !processed.is_empty()
            && let Some(cam) = &assembled.cam_emb
        {
            let replaced: Vec<(String, Tensor)> = processed
                .iter()
                .map(|(label, _)| (label.clone(), cam.clone()))
                .collect();
            combined = combine_modalities(&replaced)?;
            if let Some((active, _)) = processed.last() {
                decision = Some(route(
                    &self.experts,
                    active,
                    self.config.moe.num_experts,
                    (b, seq_len),
                    cam.dtype(),
                    cam.device(),
                )?);
            }
        }

        if inputs.use_gradient_checkpointing {
            tracing::trace!(
                offload = inputs.use_gradient_checkpointing_offload,
                "gradient checkpointing requested; blocks run eagerly"
            );
        }

        let moe = match (&combined, &decision) {
            (Some(combined), Some(decision)) => Some(MoeRouting { combined, decision }),
            _ => None,
        };
        let ctx = BlockContext {
            t_mod: &t_mod,
            freqs: &assembled.freqs,
            context: context.as_ref(),
            cam_emb: assembled.cam_emb.as_ref(),
            moe,
        };

        let mut stats = ForwardStats::default();
        let mut hidden = assembled.tokens;
        for (i, block) in self.blocks.iter().enumerate() {
            let (next, block_stats) = block.forward(&hidden, &ctx)?;
            hidden = next;
            if let Some(s) = block_stats {
                tracing::debug!(
                    block = i,
                    modality = %s.modality,
                    target_usage = s.target_expert_usage,
                    "expert statistics"
                );
                stats.blocks.push(BlockStats { block: i, stats: s });
            }
        }

        let hidden = hidden.narrow(1, seq_len - original_context_length, original_context_length)?;
        let out = self.head.forward(&hidden, &t)?;
        let prediction = unpatchify(&out, grid, self.config.out_dim, self.config.patch_size)?;

        let specialization_loss = match &decision {
            Some(d) => d.specialization_loss.clone(),
            None => Tensor::zeros((), DType::F32, prediction.device())?,
        };

        Ok(ModelOutput {
            prediction,
            specialization_loss,
            router: decision,
            stats,
        })
    }
}

/// Give newly created camera adapters their starting values: `cam_encoder`
/// zero, `projector` identity with zero bias.
fn init_camera_adapters(
    varmap: &VarMap,
    config: &WanModelConfig,
    existing: &HashSet<String>,
) -> Result<()> {
    if !config.camera.enabled {
        return Ok(());
    }
    let dim = config.dim;
    let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let mut initialized = 0;
    for i in 0..config.num_layers {
        for param in [
            "projector.weight",
            "projector.bias",
            "cam_encoder.weight",
            "cam_encoder.bias",
        ] {
            let name = format!("blocks.{i}.{param}");
            if existing.contains(&name) {
                continue;
            }
            let Some(var) = data.get(&name) else {
                candle_core::bail!("varmap has no {name}");
            };
            let value = if param == "projector.weight" {
                identity(dim, var.dtype(), var.device())?
            } else {
                Tensor::zeros(var.shape(), var.dtype(), var.device())?
            };
            var.set(&value)?;
            initialized += 1;
        }
    }
    tracing::debug!(initialized, "camera adapters initialized");
    Ok(())
}
