//! Common building blocks shared by the DiT layers
//!
//! - **attention**: Cross-platform attention dispatch (CUDA Flash-Attn / Metal SDPA / CPU)
//! - **norms**: RmsNorm, LayerNormNoParams and AffineLayerNorm
//! - **precision**: the dtype round-trip used by norms, rotary math and experts

pub mod attention;
pub mod norms;
pub mod precision;

pub use attention::{AttentionConfig, CrossPlatformAttention};
pub use norms::{AffineLayerNorm, LayerNormNoParams, RmsNorm};
pub use precision::{PrecisionBoundary, extended_precision};
