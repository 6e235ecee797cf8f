//! ReCam fine-tuning step
//!
//! Latents arrive as `[B, C, T, H, W]` with the target frames first and the
//! condition frames after them. Only the target segment is noised and scored;
//! the condition segment is fed back clean.

use candle_core::{DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::config::{FlowMatchConfig, TrainConfig};
use crate::model::{ForwardInputs, ModelOutput, WanModel};
use crate::scheduler::FlowMatchScheduler;
use crate::utils::deterministic_rng::Pcg32;

/// Variables whose name contains any of `keywords`, sorted by name
pub fn trainable_vars(varmap: &VarMap, keywords: &[String]) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| keywords.iter().any(|k| name.contains(k.as_str())))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Centre-crop the spatial axes of `[B, C, T, H, W]` to at most `max_h x max_w`
pub fn center_crop_latents(latents: &Tensor, max_h: usize, max_w: usize) -> Result<Tensor> {
    let (_, _, _, h, w) = latents.dims5()?;
    if h <= max_h && w <= max_w {
        return Ok(latents.clone());
    }
    let th = h.min(max_h);
    let tw = w.min(max_w);
    latents.narrow(3, (h - th) / 2, th)?.narrow(4, (w - tw) / 2, tw)
}

/// Pad `[B, F_cam, D]` with zero rows (or truncate) to `frames` rows.
/// The condition segment carries no camera offset.
pub fn extend_camera(cam: &Tensor, frames: usize) -> Result<Tensor> {
    let (b, f, d) = cam.dims3()?;
    if f >= frames {
        return cam.narrow(1, 0, frames);
    }
    let pad = Tensor::zeros((b, frames - f, d), cam.dtype(), cam.device())?;
    Tensor::cat(&[cam, &pad], 1)
}

/// One training sample
#[derive(Debug, Clone)]
pub struct TrainingBatch<'a> {
    /// `[B, C, T_target + T_cond, H, W]`
    pub latents: &'a Tensor,
    /// Text context `[B, L, text_dim]`
    pub context: &'a Tensor,
    /// Relative poses of the target trajectory `[B, T_target, 12]`
    pub cam_emb: &'a Tensor,
    pub clip_feature: Option<&'a Tensor>,
    pub y: Option<&'a Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub loss: f32,
    pub timestep: f64,
    pub weight: f64,
}

pub struct ReCamTrainer {
    model: WanModel,
    varmap: VarMap,
    scheduler: FlowMatchScheduler,
    optimizer: AdamW,
    config: TrainConfig,
    rng: Pcg32,
    trainable: Vec<String>,
}

impl ReCamTrainer {
    pub fn new(
        model: WanModel,
        varmap: VarMap,
        schedule: FlowMatchConfig,
        config: TrainConfig,
    ) -> Result<Self> {
        let mut scheduler = FlowMatchScheduler::new(schedule);
        let steps = scheduler.config().num_train_timesteps;
        scheduler.set_timesteps(steps, 1.0, true);

        let vars = trainable_vars(&varmap, &config.trainable_keywords)?;
        if vars.is_empty() {
            candle_core::bail!(
                "no variable matches the trainable keywords {:?}",
                config.trainable_keywords
            );
        }
        let params: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
        tracing::info!(tensors = vars.len(), params, "trainable parameters selected");
        let trainable = vars.iter().map(|(n, _)| n.clone()).collect();

        let optimizer = AdamW::new(
            vars.into_iter().map(|(_, v)| v).collect(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;
        let rng = Pcg32::from_seed(config.seed);

        Ok(Self {
            model,
            varmap,
            scheduler,
            optimizer,
            config,
            rng,
            trainable,
        })
    }

    pub fn model(&self) -> &WanModel {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn scheduler(&self) -> &FlowMatchScheduler {
        &self.scheduler
    }

    pub fn trainable_names(&self) -> &[String] {
        &self.trainable
    }

    /// Draw a training timestep from the schedule
    pub fn sample_timestep(&mut self) -> Result<f64> {
        let n = self.scheduler.timesteps().len();
        let id = self.rng.next_below(n as u32) as usize;
        match self.scheduler.timesteps().get(id) {
            Some(t) => Ok(*t),
            None => candle_core::bail!("timestep index {id} outside a schedule of {n}"),
        }
    }

    /// Weighted target-segment loss at `timestep`, with the model output
    pub fn compute_loss(
        &mut self,
        batch: &TrainingBatch<'_>,
        timestep: f64,
    ) -> Result<(Tensor, ModelOutput, f64)> {
        let latents = center_crop_latents(
            batch.latents,
            self.config.max_latent_height,
            self.config.max_latent_width,
        )?;
        let frames = latents.dim(2)?;
        let tgt = self.config.target_frames;
        if frames < tgt {
            candle_core::bail!("latents have {frames} frames, fewer than {tgt} target frames");
        }

        let noise = self.rng.randn_like(&latents)?;
        let noisy = self.scheduler.add_noise(&latents, &noise, timestep)?;
        let noisy = if frames > tgt {
            Tensor::cat(
                &[&noisy.narrow(2, 0, tgt)?, &latents.narrow(2, tgt, frames - tgt)?],
                2,
            )?
        } else {
            noisy
        };
        let target = self.scheduler.training_target(&latents, &noise)?;

        let t = Tensor::new(&[timestep as f32], latents.device())?;
        let patch_frames = frames / self.model.config().patch_size[0];
        let cam_emb = extend_camera(batch.cam_emb, patch_frames)?;
        let inputs = ForwardInputs {
            context: Some(batch.context),
            cam_emb: Some(&cam_emb),
            clip_feature: batch.clip_feature,
            y: batch.y,
            use_gradient_checkpointing: self.config.use_gradient_checkpointing,
            use_gradient_checkpointing_offload: self.config.use_gradient_checkpointing_offload,
            ..Default::default()
        };
        let output = self.model.forward(&noisy, &t, &inputs)?;

        let pred = output.prediction.narrow(2, 0, tgt)?.to_dtype(DType::F32)?;
        let target = target.narrow(2, 0, tgt)?.to_dtype(DType::F32)?;
        let weight = self.scheduler.training_weight(timestep)?;
        let loss = candle_nn::loss::mse(&pred, &target)?.affine(weight, 0.0)?;
        Ok((loss, output, weight))
    }

    /// Sample a timestep, compute the loss and update the trainable variables
    pub fn step(&mut self, batch: &TrainingBatch<'_>) -> Result<StepReport> {
        let timestep = self.sample_timestep()?;
        let (loss, _, weight) = self.compute_loss(batch, timestep)?;
        self.optimizer.backward_step(&loss)?;
        let loss = loss.to_scalar::<f32>()?;
        tracing::debug!(loss, timestep, weight, "training step");
        Ok(StepReport {
            loss,
            timestep,
            weight,
        })
    }

    /// Write every model variable to a safetensors file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.varmap.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_center_crop() -> Result<()> {
        let x = Tensor::arange(0f32, 2.0 * 50.0 * 80.0, &Device::Cpu)?.reshape((1, 1, 2, 50, 80))?;
        let y = center_crop_latents(&x, 40, 70)?;
        assert_eq!(y.dims(), &[1, 1, 2, 40, 70]);
        // first element sits at row 5, column 5
        let first = y.flatten_all()?.get(0)?.to_scalar::<f32>()?;
        assert_eq!(first, (5 * 80 + 5) as f32);

        let small = Tensor::zeros((1, 1, 2, 30, 60), DType::F32, &Device::Cpu)?;
        assert_eq!(center_crop_latents(&small, 40, 70)?.dims(), &[1, 1, 2, 30, 60]);
        Ok(())
    }

    #[test]
    fn test_extend_camera_pads_condition_frames() -> Result<()> {
        let cam = Tensor::ones((1, 2, 12), DType::F32, &Device::Cpu)?;
        let full = extend_camera(&cam, 5)?;
        assert_eq!(full.dims(), &[1, 5, 12]);
        assert_eq!(full.sum_all()?.to_scalar::<f32>()?, 24.0);
        assert_eq!(extend_camera(&cam, 1)?.dims(), &[1, 1, 12]);
        Ok(())
    }

    #[test]
    fn test_trainable_vars_by_keyword() -> Result<()> {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        candle_nn::linear(2, 2, vb.pp("blocks.0.self_attn.q"))?;
        candle_nn::linear(2, 2, vb.pp("blocks.0.cross_attn.q"))?;
        candle_nn::linear(2, 2, vb.pp("blocks.0.cam_encoder"))?;
        let keywords = TrainConfig::default().trainable_keywords;
        let names: Vec<String> = trainable_vars(&varmap, &keywords)?
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            names,
            vec![
                "blocks.0.cam_encoder.bias",
                "blocks.0.cam_encoder.weight",
                "blocks.0.self_attn.q.bias",
                "blocks.0.self_attn.q.weight",
            ]
        );
        Ok(())
    }
}
