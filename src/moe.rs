//! Modality mixture-of-experts
//!
//! Side-channel modality embeddings (camera trajectories from different
//! datasets) are projected into a shared width and combined by per-block expert
//! linears. Routing is deterministic: the modality label selects one expert for
//! every token with weight 1.0, so the combiner reduces to that expert's
//! output. Every expert is still evaluated densely for all tokens.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use serde::Serialize;

use crate::common::precision::PrecisionBoundary;
use crate::config::MoeConfig;

/// Slots per token emitted by the router
pub const ROUTER_TOP_K: usize = 1;

/// Modality label → expert id
#[derive(Debug, Clone)]
pub struct ModalityExpertMap {
    table: HashMap<String, usize>,
    fallback: usize,
}

impl Default for ModalityExpertMap {
    fn default() -> Self {
        let table = [("sekai", 0), ("nuscenes", 1), ("openx", 2), ("unknown", 0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self { table, fallback: 0 }
    }
}

impl ModalityExpertMap {
    /// Unmapped labels go to the fallback expert.
    pub fn expert_for(&self, modality: &str) -> usize {
        self.table.get(modality).copied().unwrap_or(self.fallback)
    }

    pub fn contains(&self, modality: &str) -> bool {
        self.table.contains_key(modality)
    }
}

/// Routing shared by every block of one forward pass
#[derive(Debug, Clone)]
pub struct RouterDecision {
    /// (B, S, top_k) u32
    pub expert_indices: Tensor,
    /// (B, S, top_k) in the embedding dtype
    pub expert_weights: Tensor,
    /// Scalar f32, always zero
    pub specialization_loss: Tensor,
    pub modality: String,
    pub expert: usize,
}

impl RouterDecision {
    pub fn top_k(&self) -> Result<usize> {
        self.expert_indices.dim(2)
    }
}

/// Route every token of a `(b, s)` sequence to the expert mapped to `modality`.
pub fn route(
    map: &ModalityExpertMap,
    modality: &str,
    num_experts: usize,
    (b, s): (usize, usize),
    dtype: DType,
    device: &Device,
) -> Result<RouterDecision> {
    let expert = map.expert_for(modality);
    if expert >= num_experts {
        candle_core::bail!(
            "modality '{modality}' maps to expert {expert} but only {num_experts} experts exist"
        );
    }
    let shape = (b, s, ROUTER_TOP_K);
    let expert_indices = Tensor::full(expert as u32, shape, device)?;
    let expert_weights = Tensor::ones(shape, dtype, device)?;
    let specialization_loss = Tensor::zeros((), DType::F32, device)?;
    tracing::debug!(modality, expert, batch = b, tokens = s, "router decision");
    Ok(RouterDecision {
        expert_indices,
        expert_weights,
        specialization_loss,
        modality: modality.to_string(),
        expert,
    })
}

/// Projects a raw modality embedding into the unified MoE width
#[derive(Debug, Clone)]
pub struct ModalityProcessor {
    name: String,
    projector: Linear,
}

impl ModalityProcessor {
    pub fn new(name: &str, input_dim: usize, unified_dim: usize, vb: VarBuilder) -> Result<Self> {
        let projector = candle_nn::linear(input_dim, unified_dim, vb.pp("projector").pp("0"))?;
        Ok(Self {
            name: name.to_string(),
            projector,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[B, S, in]` (or `[B, in]`, read as `S = 1`) → `[B, S, unified_dim]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if x.rank() == 2 { x.unsqueeze(1)? } else { x.clone() };
        let boundary = PrecisionBoundary::new(x.dtype(), self.projector.weight().dtype());
        boundary.run(&x, |x| self.projector.forward(x))
    }
}

/// Sum of the processed modality embeddings, `None` when there are none.
pub fn combine_modalities(processed: &[(String, Tensor)]) -> Result<Option<Tensor>> {
    let mut iter = processed.iter();
    let Some((_, first)) = iter.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for (_, t) in iter {
        acc = (acc + t)?;
    }
    Ok(Some(acc))
}

/// Diagnostics for one combiner call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpertStatistics {
    pub modality: String,
    pub num_experts: usize,
    pub top_k: usize,
    pub selection_counts: Vec<usize>,
    /// count / (total + 1e-8)
    pub selection_ratios: Vec<f32>,
    /// Mean routing weight when selected, 0 for unselected experts
    pub avg_expert_weights: Vec<f32>,
    /// Mean weight per routed slot
    pub avg_top_k_weights: Vec<f32>,
    pub target_expert: usize,
    pub target_expert_usage: f32,
}

impl ExpertStatistics {
    fn compute(decision: &RouterDecision, num_experts: usize, top_k: usize) -> Result<Self> {
        let indices = decision.expert_indices.detach().to_vec3::<u32>()?;
        let weights = decision
            .expert_weights
            .detach()
            .to_dtype(DType::F32)?
            .to_vec3::<f32>()?;

        let slots = decision.top_k()?;
        let mut counts = vec![0usize; num_experts];
        let mut weight_sums = vec![0f64; num_experts];
        let mut slot_sums = vec![0f64; slots];
        let mut tokens = 0usize;
        for (row_i, row_w) in indices.iter().zip(&weights) {
            for (tok_i, tok_w) in row_i.iter().zip(row_w) {
                tokens += 1;
                for (k, (&e, &w)) in tok_i.iter().zip(tok_w).enumerate() {
                    if let Some(c) = counts.get_mut(e as usize) {
                        *c += 1;
                        weight_sums[e as usize] += w as f64;
                    }
                    slot_sums[k] += w as f64;
                }
            }
        }

        let total: usize = counts.iter().sum();
        let selection_ratios: Vec<f32> = counts
            .iter()
            .map(|&c| (c as f64 / (total as f64 + 1e-8)) as f32)
            .collect();
        let avg_expert_weights = counts
            .iter()
            .zip(&weight_sums)
            .map(|(&c, &s)| if c > 0 { (s / c as f64) as f32 } else { 0.0 })
            .collect();
        let avg_top_k_weights = slot_sums
            .iter()
            .map(|&s| if tokens > 0 { (s / tokens as f64) as f32 } else { 0.0 })
            .collect();

        let target_expert = decision.expert;
        let target_expert_usage = selection_ratios.get(target_expert).copied().unwrap_or(0.0);

        Ok(Self {
            modality: decision.modality.clone(),
            num_experts,
            top_k,
            selection_counts: counts,
            selection_ratios,
            avg_expert_weights,
            avg_top_k_weights,
            target_expert,
            target_expert_usage,
        })
    }
}

/// Dense expert evaluation with a weighted gather of the routed slots
#[derive(Debug, Clone)]
pub struct MultiModalMoe {
    experts: Vec<Linear>,
    unified_dim: usize,
    output_dim: usize,
    top_k: usize,
}

impl MultiModalMoe {
    pub fn new(cfg: &MoeConfig, output_dim: usize, vb: VarBuilder) -> Result<Self> {
        let vb_e = vb.pp("experts");
        let experts = (0..cfg.num_experts)
            .map(|i| candle_nn::linear(cfg.unified_dim, output_dim, vb_e.pp(i).pp("0")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            experts,
            unified_dim: cfg.unified_dim,
            output_dim,
            top_k: cfg.top_k,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn expert(&self, i: usize) -> Option<&Linear> {
        self.experts.get(i)
    }

    /// `x`: `[B, S, unified_dim]` → `[B, S, output_dim]` in the caller's dtype.
    pub fn forward(
        &self,
        x: &Tensor,
        decision: &RouterDecision,
    ) -> Result<(Tensor, ExpertStatistics)> {
        let (b, s, d) = x.dims3()?;
        if d != self.unified_dim {
            candle_core::bail!(
                "moe input width {d} does not match unified_dim {}",
                self.unified_dim
            );
        }
        let slots = decision.top_k()?;
        if slots > self.top_k {
            candle_core::bail!(
                "router decision carries {slots} slots but the combiner allows top_k {}",
                self.top_k
            );
        }
        let Some(first) = self.experts.first() else {
            candle_core::bail!("moe has no experts");
        };

        let boundary = PrecisionBoundary::new(x.dtype(), first.weight().dtype());
        let out = boundary.run(x, |x| {
            let outputs = self
                .experts
                .iter()
                .map(|e| e.forward(x))
                .collect::<Result<Vec<_>>>()?;
            let stacked = Tensor::stack(&outputs, 2)?;

            let mut acc = Tensor::zeros((b, s, self.output_dim), x.dtype(), x.device())?;
            for k in 0..slots {
                let idx = decision
                    .expert_indices
                    .narrow(2, k, 1)?
                    .unsqueeze(3)?
                    .broadcast_as((b, s, 1, self.output_dim))?
                    .contiguous()?;
                let picked = stacked.gather(&idx, 2)?.squeeze(2)?;
                let w = decision.expert_weights.narrow(2, k, 1)?.to_dtype(x.dtype())?;
                acc = (acc + picked.broadcast_mul(&w)?)?;
            }
            Ok(acc)
        })?;

        let stats = ExpertStatistics::compute(decision, self.experts.len(), self.top_k)?;
        Ok((out, stats))
    }
}
