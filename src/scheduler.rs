//! Flow-matching scheduler
//!
//! Sigmas run from `sigma_max` toward `sigma_min` and are shifted by
//! `s * σ / (1 + (s - 1) * σ)`. The model predicts the velocity
//! `noise - sample`, integrated with an Euler solver:
//!   x_{next} = x + (σ_next - σ) * v
//!
//! In training mode each timestep also carries a loss weight peaking in the
//! middle of the schedule.

use crate::config::FlowMatchConfig;
use candle_core::{Result, Tensor};

/// `num` evenly spaced values from `start` to `stop` inclusive
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { stop } else { start + i as f64 * step })
                .collect()
        }
    }
}

pub struct FlowMatchScheduler {
    config: FlowMatchConfig,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
    /// Per-timestep loss weights, set in training mode
    training_weights: Option<Vec<f64>>,
}

impl FlowMatchScheduler {
    /// Scheduler with a 100-step inference schedule
    pub fn new(config: FlowMatchConfig) -> Self {
        let mut scheduler = Self {
            config,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            training_weights: None,
        };
        scheduler.set_timesteps(100, 1.0, false);
        scheduler
    }

    pub fn config(&self) -> &FlowMatchConfig {
        &self.config
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    pub fn training_weights(&self) -> Option<&[f64]> {
        self.training_weights.as_deref()
    }

    /// Rebuild the schedule.
    ///
    /// `denoising_strength` below 1 starts the schedule from a partially
    /// noised sample. `training` computes the loss weights.
    pub fn set_timesteps(&mut self, num_steps: usize, denoising_strength: f64, training: bool) {
        let cfg = &self.config;
        let sigma_start = cfg.sigma_min + (cfg.sigma_max - cfg.sigma_min) * denoising_strength;
        let mut sigmas = if cfg.extra_one_step {
            let mut s = linspace(sigma_start, cfg.sigma_min, num_steps + 1);
            s.truncate(num_steps);
            s
        } else {
            linspace(sigma_start, cfg.sigma_min, num_steps)
        };
        let shift = cfg.shift;
        for s in sigmas.iter_mut() {
            *s = shift * *s / (1.0 + (shift - 1.0) * *s);
        }
        let scale = cfg.num_train_timesteps as f64;
        self.timesteps = sigmas.iter().map(|s| s * scale).collect();
        self.sigmas = sigmas;

        self.training_weights = if training && num_steps > 0 {
            let n = num_steps as f64;
            let y: Vec<f64> = self
                .timesteps
                .iter()
                .map(|t| (-2.0 * ((t - n / 2.0) / n).powi(2)).exp())
                .collect();
            let min = y.iter().copied().fold(f64::INFINITY, f64::min);
            let shifted: Vec<f64> = y.iter().map(|v| v - min).collect();
            let total: f64 = shifted.iter().sum();
            Some(if total > 0.0 {
                shifted.iter().map(|v| v * n / total).collect()
            } else {
                vec![1.0; shifted.len()]
            })
        } else {
            None
        };
        tracing::debug!(num_steps, training, "flow-match schedule set");
    }

    /// Index of the scheduled timestep closest to `timestep`
    pub fn index_for_timestep(&self, timestep: f64) -> Result<usize> {
        self.timesteps
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - timestep).abs().total_cmp(&(b.1 - timestep).abs()))
            .map(|(i, _)| i)
            .ok_or_else(|| candle_core::Error::Msg("flow-match schedule is empty".to_string()))
    }

    pub fn sigma_for_timestep(&self, timestep: f64) -> Result<f64> {
        Ok(self.sigmas[self.index_for_timestep(timestep)?])
    }

    /// One Euler step toward the next scheduled sigma (zero after the last)
    pub fn step(&self, model_output: &Tensor, timestep: f64, sample: &Tensor) -> Result<Tensor> {
        let idx = self.index_for_timestep(timestep)?;
        let sigma = self.sigmas[idx];
        let sigma_next = self.sigmas.get(idx + 1).copied().unwrap_or(0.0);
        let delta = model_output.affine(sigma_next - sigma, 0.0)?;
        sample.add(&delta.to_dtype(sample.dtype())?)
    }

    /// `(1 - σ) * original + σ * noise`
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigma_for_timestep(timestep)?;
        let term1 = original.affine(1.0 - sigma, 0.0)?;
        let term2 = noise.affine(sigma, 0.0)?;
        term1.add(&term2)
    }

    /// Velocity the model is trained to predict
    pub fn training_target(&self, sample: &Tensor, noise: &Tensor) -> Result<Tensor> {
        noise.sub(sample)
    }

    pub fn training_weight(&self, timestep: f64) -> Result<f64> {
        let Some(weights) = &self.training_weights else {
            candle_core::bail!("training weights require set_timesteps(.., training = true)");
        };
        Ok(weights[self.index_for_timestep(timestep)?])
    }
}
