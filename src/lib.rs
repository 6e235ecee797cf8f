//! Candle-ReCam: camera-conditioned video DiT for the Candle framework.
//!
//! The crate provides the Wan-style video diffusion transformer extended with
//! per-block camera adapters, multi-scale clean latent context and modality
//! expert routing, together with the checkpoint converter, flow-matching
//! schedule and ReCam fine-tuning step built around it.

pub mod assembler;
pub mod camera;
pub mod common;
pub mod config;
pub mod dit;
pub mod loader;
pub mod model;
pub mod moe;
pub mod rope;
pub mod scheduler;
pub mod stats;
pub mod train;
pub mod utils;
pub mod weight_format;

pub use assembler::{AssemblyError, CleanLatentInput, CleanScale, MultiScaleTokenAssembler};
pub use camera::{Camera, CameraError, relative_poses, sample_frame_indices};
pub use config::{
    CameraConfig, ConfigError, FlowMatchConfig, ModalityProcessorConfig, MoeConfig, TrainConfig,
    WanModelConfig,
};
pub use loader::{CheckpointLoader, LoaderError};
pub use model::{ForwardInputs, ForwardStats, ModelOutput, WanModel};
pub use moe::{ExpertStatistics, ModalityExpertMap, RouterDecision};
pub use rope::{RopeFreqs, RotaryFrequencyTable};
pub use scheduler::FlowMatchScheduler;
pub use stats::ExpertStatsReport;
pub use train::{ReCamTrainer, TrainingBatch};
pub use weight_format::{Convention, FingerprintRegistry, StateDictConverter};
