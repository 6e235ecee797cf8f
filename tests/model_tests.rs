//! WanModel forward tests
//!
//! This test module covers:
//! - Single-scale forward shapes and the zero specialization loss
//! - Camera adapters initialized at construction and starting as a no-op
//! - Modality routing through the expert combiner
//! - Top-1 expert fusion matching the selected expert linear
//! - Expert statistics report built from a forward pass

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_recam::config::{ModalityProcessorConfig, MoeConfig, WanModelConfig};
use candle_recam::dit::identity;
use candle_recam::model::{ForwardInputs, WanModel};
use candle_recam::moe::{ModalityExpertMap, MultiModalMoe, route};
use candle_recam::stats::{ExpertStatsReport, Specialization};

// ===========================================================================
// Test Helpers
// ===========================================================================

fn small_config() -> WanModelConfig {
    WanModelConfig {
        dim: 64,
        ffn_dim: 128,
        num_heads: 4,
        num_layers: 1,
        use_accelerated_attention: false,
        ..WanModelConfig::t2v_1_3b()
    }
}

fn moe_config() -> WanModelConfig {
    WanModelConfig {
        num_layers: 2,
        use_moe: true,
        moe: MoeConfig {
            unified_dim: 8,
            num_experts: 4,
            top_k: 1,
        },
        modality_processors: vec![ModalityProcessorConfig {
            name: "nuscenes".to_string(),
            input_dim: 12,
        }],
        ..small_config()
    }
}

fn build(config: &WanModelConfig, device: &Device) -> Result<(WanModel, VarMap)> {
    let varmap = VarMap::new();
    let model = WanModel::from_varmap(config, &varmap, DType::F32, device)?;
    Ok((model, varmap))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.max_all()?.to_scalar::<f32>()
}

// ===========================================================================
// Single-scale forward
// ===========================================================================

#[test]
fn test_forward_single_scale_shape() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;

    let latents = Tensor::randn(0f32, 1.0, (1, 16, 4, 16, 16), &device)?;
    let context = Tensor::randn(0f32, 1.0, (1, 10, 4096), &device)?;
    let t = Tensor::new(&[500f32], &device)?;

    let out = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            context: Some(&context),
            ..Default::default()
        },
    )?;

    assert_eq!(out.prediction.dims(), &[1, 16, 4, 16, 16]);
    assert_eq!(out.specialization_loss.to_scalar::<f32>()?, 0.0);
    assert!(out.router.is_none());
    assert!(out.stats.blocks.is_empty());
    Ok(())
}

#[test]
fn test_forward_without_context_skips_cross_attention() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 2, 8, 8), &device)?;
    let t = Tensor::new(&[10f32], &device)?;
    let out = model.forward(&latents, &t, &ForwardInputs::default())?;
    assert_eq!(out.prediction.dims(), &[1, 16, 2, 8, 8]);
    Ok(())
}

#[test]
fn test_forward_is_deterministic() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 2, 8, 8), &device)?;
    let context = Tensor::randn(0f32, 1.0, (1, 6, 4096), &device)?;
    let t = Tensor::new(&[250f32], &device)?;
    let inputs = ForwardInputs {
        context: Some(&context),
        ..Default::default()
    };
    let a = model.forward(&latents, &t, &inputs)?;
    let b = model.forward(&latents, &t, &inputs)?;
    assert_eq!(max_abs_diff(&a.prediction, &b.prediction)?, 0.0);
    Ok(())
}

fn var(varmap: &VarMap, name: &str) -> Result<Tensor> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    match data.get(name) {
        Some(v) => Ok(v.as_tensor().copy()?),
        None => candle_core::bail!("no variable {name}"),
    }
}

#[test]
fn test_construction_initializes_camera_adapters() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    assert!(config.camera.enabled);
    let (_model, varmap) = build(&config, &device)?;

    let projector = var(&varmap, "blocks.0.projector.weight")?;
    let eye = identity(config.dim, DType::F32, &device)?;
    assert_eq!(max_abs_diff(&projector, &eye)?, 0.0);
    for name in [
        "blocks.0.projector.bias",
        "blocks.0.cam_encoder.weight",
        "blocks.0.cam_encoder.bias",
    ] {
        let t = var(&varmap, name)?;
        assert_eq!(t.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0, "{name}");
    }
    Ok(())
}

#[test]
fn test_existing_adapters_are_kept() -> Result<()> {
    let device = Device::Cpu;
    let config = small_config();
    let (_model, varmap) = build(&config, &device)?;
    let trained = Tensor::full(0.5f32, (config.dim, 12), &device)?;
    {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        if let Some(v) = data.get("blocks.0.cam_encoder.weight") {
            v.set(&trained)?;
        }
    }

    let _rebuilt = WanModel::from_varmap(&config, &varmap, DType::F32, &device)?;
    let kept = var(&varmap, "blocks.0.cam_encoder.weight")?;
    assert_eq!(max_abs_diff(&kept, &trained)?, 0.0);
    Ok(())
}

#[test]
fn test_fresh_camera_adapters_are_identity() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 3, 8, 8), &device)?;
    let context = Tensor::randn(0f32, 1.0, (1, 5, 4096), &device)?;
    let cam = Tensor::randn(0f32, 1.0, (1, 3, 12), &device)?;
    let t = Tensor::new(&[700f32], &device)?;

    let plain = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            context: Some(&context),
            ..Default::default()
        },
    )?;
    let with_cam = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            context: Some(&context),
            cam_emb: Some(&cam),
            ..Default::default()
        },
    )?;
    assert!(max_abs_diff(&plain.prediction, &with_cam.prediction)? < 1e-5);
    Ok(())
}

#[test]
fn test_short_camera_is_rejected() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 4, 8, 8), &device)?;
    let cam = Tensor::zeros((1, 2, 12), DType::F32, &device)?;
    let t = Tensor::new(&[1f32], &device)?;
    let res = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            cam_emb: Some(&cam),
            ..Default::default()
        },
    );
    assert!(res.is_err());
    Ok(())
}

#[test]
fn test_timestep_batch_mismatch() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 1, 4, 4), &device)?;
    let t = Tensor::new(&[1f32, 2.0], &device)?;
    assert!(model.forward(&latents, &t, &ForwardInputs::default()).is_err());
    Ok(())
}

// ===========================================================================
// Modality routing
// ===========================================================================

#[test]
fn test_nuscenes_routes_to_expert_one() -> Result<()> {
    let device = Device::Cpu;
    let config = moe_config();
    let (model, _varmap) = build(&config, &device)?;

    let latents = Tensor::randn(0f32, 1.0, (1, 16, 4, 8, 8), &device)?;
    let context = Tensor::randn(0f32, 1.0, (1, 4, 4096), &device)?;
    let cam = Tensor::randn(0f32, 1.0, (1, 4, 12), &device)?;
    let t = Tensor::new(&[300f32], &device)?;

    let out = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            context: Some(&context),
            modality_inputs: vec![("nuscenes", &cam)],
            ..Default::default()
        },
    )?;
    assert_eq!(out.prediction.dims(), &[1, 16, 4, 8, 8]);

    let router = out.router.as_ref().expect("router decision");
    assert_eq!(router.expert, 1);
    assert_eq!(router.modality, "nuscenes");
    // 4 frames of a 4x4 token grid
    assert_eq!(router.expert_indices.dims(), &[1, 64, 1]);
    let indices = router.expert_indices.flatten_all()?.to_vec1::<u32>()?;
    assert!(indices.iter().all(|&i| i == 1));
    assert_eq!(out.specialization_loss.to_scalar::<f32>()?, 0.0);

    let blocks: Vec<usize> = out.stats.blocks.iter().map(|b| b.block).collect();
    assert_eq!(blocks, vec![0, 1]);
    for b in &out.stats.blocks {
        assert_eq!(b.stats.target_expert, 1);
        assert!((b.stats.target_expert_usage - 1.0).abs() < 1e-6);
        assert_eq!(b.stats.selection_counts, vec![0, 64, 0, 0]);
    }
    Ok(())
}

#[test]
fn test_unregistered_modality_is_skipped() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&moe_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 2, 4, 4), &device)?;
    let cam = Tensor::randn(0f32, 1.0, (1, 2, 12), &device)?;
    let t = Tensor::new(&[300f32], &device)?;
    let out = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            modality_inputs: vec![("kitti", &cam)],
            ..Default::default()
        },
    )?;
    assert!(out.router.is_none());
    assert!(out.stats.blocks.is_empty());
    Ok(())
}

#[test]
fn test_router_is_deterministic() -> Result<()> {
    let device = Device::Cpu;
    let map = ModalityExpertMap::default();
    let a = route(&map, "openx", 4, (2, 7), DType::F32, &device)?;
    let b = route(&map, "openx", 4, (2, 7), DType::F32, &device)?;
    assert_eq!(
        a.expert_indices.flatten_all()?.to_vec1::<u32>()?,
        b.expert_indices.flatten_all()?.to_vec1::<u32>()?
    );
    assert_eq!(max_abs_diff(&a.expert_weights, &b.expert_weights)?, 0.0);
    Ok(())
}

#[test]
fn test_top1_fusion_equals_selected_expert() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let cfg = MoeConfig {
        unified_dim: 8,
        num_experts: 4,
        top_k: 1,
    };
    let moe = MultiModalMoe::new(&cfg, 32, vb)?;
    let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;

    for (modality, expert) in [("sekai", 0), ("nuscenes", 1), ("openx", 2)] {
        let decision = route(&ModalityExpertMap::default(), modality, 4, (2, 5), DType::F32, &device)?;
        let (fused, stats) = moe.forward(&x, &decision)?;
        let direct = moe.expert(expert).expect("expert").forward(&x)?;
        assert!(max_abs_diff(&fused, &direct)? < 1e-5, "{modality}");
        assert_eq!(stats.target_expert, expert);
    }
    Ok(())
}

// ===========================================================================
// Statistics report
// ===========================================================================

#[test]
fn test_report_from_forward_pass() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&moe_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 2, 4, 4), &device)?;
    let cam = Tensor::randn(0f32, 1.0, (1, 2, 12), &device)?;
    let t = Tensor::new(&[300f32], &device)?;
    let out = model.forward(
        &latents,
        &t,
        &ForwardInputs {
            modality_inputs: vec![("nuscenes", &cam)],
            ..Default::default()
        },
    )?;

    let report = ExpertStatsReport::from_context(&out.stats);
    assert_eq!(report.modalities.len(), 1);
    let m = &report.modalities[0];
    assert_eq!(m.modality, "nuscenes");
    assert_eq!(m.blocks, 2);
    assert_eq!(m.target_expert, 1);
    assert_eq!(m.specialization, Specialization::High);
    assert!(m.target_is_most_used());

    let text = report.to_string();
    assert!(text.contains("NUSCENES modality (2 MoE blocks)"));
    assert!(text.contains("* Expert-1"));
    Ok(())
}

#[test]
fn test_report_empty_without_experts() -> Result<()> {
    let device = Device::Cpu;
    let (model, _varmap) = build(&small_config(), &device)?;
    let latents = Tensor::randn(0f32, 1.0, (1, 16, 1, 4, 4), &device)?;
    let t = Tensor::new(&[1f32], &device)?;
    let out = model.forward(&latents, &t, &ForwardInputs::default())?;
    assert!(ExpertStatsReport::from_context(&out.stats).is_empty());
    Ok(())
}
