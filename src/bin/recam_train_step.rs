//! Run ReCam fine-tuning steps on one cached sample
//!
//! The sample is a safetensors file with `latents` `[1, C, T, H, W]` (target
//! frames first), `context` `[1, L, text_dim]` and optionally `camera`
//! `[1, T_target, 12]`. Without `camera`, poses are computed from
//! `--extrinsics` for the given condition and target views.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin recam_train_step -- \
//!     --checkpoint ./Wan2.1-T2V-1.3B \
//!     --sample ./sample.safetensors \
//!     --extrinsics ./cameras/camera_extrinsics.json --condition-view 3 --target-view 1 \
//!     --steps 10 --output recam.safetensors
//! ```

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use candle_recam::{
    camera::CameraExtrinsics,
    config::{FlowMatchConfig, TrainConfig, WanModelConfig},
    loader::{CheckpointLoader, load_model_config},
    train::{ReCamTrainer, TrainingBatch},
    weight_format::StateDictConverter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "ReCam camera-adapter fine-tuning")]
struct Args {
    /// Base checkpoint (file or directory)
    #[arg(long)]
    checkpoint: PathBuf,

    /// Model configuration JSON; defaults to the fingerprinted architecture
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training configuration JSON
    #[arg(long)]
    train_config: Option<PathBuf>,

    /// Cached sample (safetensors)
    #[arg(long)]
    sample: PathBuf,

    /// camera_extrinsics.json used when the sample carries no `camera`
    #[arg(long)]
    extrinsics: Option<PathBuf>,

    #[arg(long, default_value = "1")]
    condition_view: usize,

    #[arg(long, default_value = "2")]
    target_view: usize,

    #[arg(long, default_value = "1")]
    steps: usize,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Where to write the trained weights
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    bf16: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_recam=info".parse()?)
                .add_directive("recam_train_step=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = if args.bf16 { DType::BF16 } else { DType::F32 };
    info!("Device: {:?}, dtype: {:?}", device, dtype);

    let loader = CheckpointLoader::new(
        device.clone(),
        dtype,
        StateDictConverter::with_embedded_registry()?,
    );
    let converted = loader.load_converted(&args.checkpoint)?;

    let model_config = match (&args.config, &converted.config) {
        (Some(path), _) => load_model_config::<WanModelConfig>(path)?,
        (None, Some(arch)) => arch.apply_to(WanModelConfig::default()),
        (None, None) => bail!(
            "fingerprint {} is not registered; pass --config",
            converted.fingerprint
        ),
    };
    let (model, varmap, report) = loader.build_model(&model_config, &converted.tensors)?;
    if !report.unexpected.is_empty() {
        warn!("{} checkpoint tensors unused", report.unexpected.len());
    }
    info!("{} variables left at their initial value", report.initialized.len());

    let mut train_config = match &args.train_config {
        Some(path) => load_model_config::<TrainConfig>(path)?,
        None => TrainConfig::default(),
    };
    train_config.seed = args.seed;
    if let Some(lr) = args.learning_rate {
        train_config.learning_rate = lr;
    }
    let target_frames = train_config.target_frames;

    let sample = candle_core::safetensors::load(&args.sample, &device)
        .with_context(|| format!("loading sample {}", args.sample.display()))?;
    let latents = sample
        .get("latents")
        .context("sample has no `latents`")?
        .to_dtype(dtype)?;
    let context = sample
        .get("context")
        .context("sample has no `context`")?
        .to_dtype(dtype)?;
    let camera = match (sample.get("camera"), &args.extrinsics) {
        (Some(cam), _) => cam.clone(),
        (None, Some(path)) => {
            let extrinsics = CameraExtrinsics::load(path)?;
            let tgt_len = target_frames.min(latents.dim(2)?);
            extrinsics
                .relative_embedding(args.condition_view, args.target_view, tgt_len, &device)?
                .unsqueeze(0)?
        }
        (None, None) => bail!("sample has no `camera`; pass --extrinsics"),
    }
    .to_dtype(dtype)?;

    let mut trainer = ReCamTrainer::new(model, varmap, FlowMatchConfig::default(), train_config)?;
    let batch = TrainingBatch {
        latents: &latents,
        context: &context,
        cam_emb: &camera,
        clip_feature: sample.get("clip_feature"),
        y: sample.get("y"),
    };
    for step in 0..args.steps {
        let report = trainer.step(&batch)?;
        info!(
            "step {step}: loss {:.6} (timestep {:.1}, weight {:.4})",
            report.loss, report.timestep, report.weight
        );
    }

    if let Some(out) = &args.output {
        trainer.save(out)?;
        info!("Saved weights to {}", out.display());
    }
    Ok(())
}
