//! Normalization layers
//!
//! - RmsNorm: query/key normalization inside attention
//! - LayerNormNoParams: LayerNorm without learnable parameters (norm1, norm2, head)
//! - AffineLayerNorm: `norm3` and the CLIP projection norms, built from tensor
//!   ops so gradients reach the fine-tuned adapters

use candle_core::{D, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::precision::PrecisionBoundary;

/// LayerNorm without learnable parameters (elementwise_affine=False)
///
/// Normalizes input to zero mean and unit variance without learnable scale/bias.
#[derive(Debug, Clone)]
pub struct LayerNormNoParams {
    eps: f64,
}

impl LayerNormNoParams {
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }
}

impl Module for LayerNormNoParams {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden_size = x.dim(D::Minus1)?;
        PrecisionBoundary::upcast_half(x.dtype()).run(x, |x| {
            let mean_x = (x.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
            let x = x.broadcast_sub(&mean_x)?;
            let norm_x = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
            x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)
        })
    }
}

/// LayerNorm with `weight` and `bias`
#[derive(Debug, Clone)]
pub struct AffineLayerNorm {
    inner: LayerNormNoParams,
    weight: Tensor,
    bias: Tensor,
}

impl AffineLayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::init::ONE)?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::init::ZERO)?;
        Ok(Self {
            inner: LayerNormNoParams::new(eps),
            weight,
            bias,
        })
    }
}

impl Module for AffineLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normed = self.inner.forward(x)?;
        normed
            .broadcast_mul(&self.weight.to_dtype(normed.dtype())?)?
            .broadcast_add(&self.bias.to_dtype(normed.dtype())?)
    }
}

/// RMSNorm with a learnable scale
///
/// Normalizes in f32, casts back to the input dtype, then applies the weight:
/// `norm(x.float()).to(dtype) * weight`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::init::ONE)?;
        Ok(Self { weight, eps })
    }

    pub fn from_weight(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden_size = x.dim(D::Minus1)?;
        let normed = PrecisionBoundary::upcast_half(x.dtype()).run(x, |x| {
            let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
            x.broadcast_div(&(variance + self.eps)?.sqrt()?)
        })?;
        normed.broadcast_mul(&self.weight.to_dtype(normed.dtype())?)
    }
}
