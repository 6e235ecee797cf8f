//! Multi-scale token assembly
//!
//! The primary latent is patchified into tokens; clean context latents at
//! 1x, 2x and 4x compression are embedded and prepended so the final
//! sequence reads `[4x][2x][1x][primary]`. Per-token rotary frequencies and
//! camera embeddings are assembled in the same order, so all three stay
//! aligned position by position.

use std::str::FromStr;

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::rope::{RopeFreqs, RotaryFrequencyTable};

/// Errors specific to sequence assembly
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("unsupported clean latent scale '{0}', expected one of 1x, 2x, 4x")]
    UnsupportedScale(String),

    #[error("token sequence has {tokens} entries but rotary frequencies cover {freqs}")]
    RopeLengthMismatch { tokens: usize, freqs: usize },

    #[error("token sequence has {tokens} entries but camera embedding covers {camera}")]
    CameraLengthMismatch { tokens: usize, camera: usize },

    #[error("{what} index {index} is negative")]
    NegativeIndex { what: &'static str, index: i64 },

    #[error("camera rows {start}..{end} fall outside an embedding of {len} frames")]
    CameraOutOfRange { start: i64, end: i64, len: usize },

    #[error("latent_indices has {rows} rows for a batch of {batch}")]
    BatchMismatch { rows: usize, batch: usize },
}

impl From<AssemblyError> for candle_core::Error {
    fn from(e: AssemblyError) -> Self {
        candle_core::Error::wrap(e)
    }
}

// ===========================================================================
// Patch Embedding
// ===========================================================================

/// Token grid produced by patchification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub f: usize,
    pub h: usize,
    pub w: usize,
}

impl PatchGrid {
    pub fn tokens(&self) -> usize {
        self.f * self.h * self.w
    }
}

/// Conv3d with kernel == stride, expressed as a patch rearrangement followed
/// by a linear projection over `(c, pt, ph, pw)`.
///
/// The checkpoint weight `[dim, c, pt, ph, pw]` is flattened to
/// `[dim, c * pt * ph * pw]` at load time.
#[derive(Debug, Clone)]
pub struct PatchEmbedding {
    proj: Linear,
    patch: [usize; 3],
    in_channels: usize,
}

impl PatchEmbedding {
    pub fn new(in_channels: usize, dim: usize, patch: [usize; 3], vb: VarBuilder) -> Result<Self> {
        let [pt, ph, pw] = patch;
        let weight = vb.get_with_hints(
            (dim, in_channels, pt, ph, pw),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::init::ZERO)?;
        let weight = weight.reshape((dim, in_channels * pt * ph * pw))?;
        Ok(Self {
            proj: Linear::new(weight, Some(bias)),
            patch,
            in_channels,
        })
    }

    pub fn patch_size(&self) -> [usize; 3] {
        self.patch
    }

    /// Rearrange `[B, C, T, H, W]` into `[B, f*h*w, C*pt*ph*pw]`.
    ///
    /// Trailing frames/rows/columns that do not fill a patch are dropped, as a
    /// strided convolution would.
    pub fn patchify(&self, x: &Tensor) -> Result<(Tensor, PatchGrid)> {
        patchify(x, self.patch)
    }

    /// `[B, C, T, H, W]` → tokens `[B, f*h*w, dim]`
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, PatchGrid)> {
        let c = x.dim(1)?;
        if c != self.in_channels {
            candle_core::bail!(
                "patch embedding expects {} channels, got {c}",
                self.in_channels
            );
        }
        let x = x.to_dtype(self.proj.weight().dtype())?;
        let (patches, grid) = self.patchify(&x)?;
        Ok((self.proj.forward(&patches)?, grid))
    }
}

/// Patch rearrangement with `(c, pt, ph, pw)` channel order.
pub fn patchify(x: &Tensor, patch: [usize; 3]) -> Result<(Tensor, PatchGrid)> {
    let (b, c, t, h, w) = x.dims5()?;
    let [pt, ph, pw] = patch;
    let grid = PatchGrid {
        f: t / pt,
        h: h / ph,
        w: w / pw,
    };
    if grid.tokens() == 0 {
        candle_core::bail!("latent [{t}, {h}, {w}] is smaller than patch {patch:?}");
    }
    let x = x
        .narrow(2, 0, grid.f * pt)?
        .narrow(3, 0, grid.h * ph)?
        .narrow(4, 0, grid.w * pw)?;
    let (h, w) = (grid.h * ph, grid.w * pw);

    // (B, C, f, pt, H*W) -> (B, f, C, pt, H*W) -> (B*f, C*pt, H, W)
    let x = x
        .reshape((b, c, grid.f, pt, h * w))?
        .permute((0, 2, 1, 3, 4))?
        .reshape((b * grid.f, c * pt, h, w))?;
    // (B*f, C*pt, h, ph, w, pw) -> (B*f, h, w, C*pt, ph, pw)
    let x = x
        .reshape((b * grid.f, c * pt, grid.h, ph, grid.w, pw))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, grid.tokens(), c * pt * ph * pw))?;
    Ok((x, grid))
}

/// Inverse of the head layout: tokens `[B, f*h*w, pt*ph*pw*C]` with
/// `(pt, ph, pw, c)` channel order → `[B, C, f*pt, h*ph, w*pw]`.
pub fn unpatchify(x: &Tensor, grid: PatchGrid, out_dim: usize, patch: [usize; 3]) -> Result<Tensor> {
    let (b, n, width) = x.dims3()?;
    let [pt, ph, pw] = patch;
    if n != grid.tokens() || width != pt * ph * pw * out_dim {
        candle_core::bail!(
            "cannot unpatchify [{b}, {n}, {width}] into grid {grid:?} with patch {patch:?} and {out_dim} channels"
        );
    }
    let PatchGrid { f, h, w } = grid;
    let (hh, ww) = (h * ph, w * pw);

    // (B*f, h*w, pt, ph*pw, C) -> (B*f, C, pt, h*w, ph*pw)
    let x = x
        .reshape((b * f, h * w, pt, ph * pw, out_dim))?
        .permute((0, 4, 2, 1, 3))?;
    // (B*f, C*pt, h, w, ph, pw) -> (B*f, C*pt, h, ph, w, pw)
    let x = x
        .reshape((b * f, out_dim * pt, h, w, ph, pw))?
        .permute((0, 1, 2, 4, 3, 5))?
        .reshape((b * f, out_dim * pt, hh, ww))?;
    // (B, f, C, pt, H*W) -> (B, C, f, pt, H*W)
    x.reshape((b, f, out_dim, pt, hh * ww))?
        .permute((0, 2, 1, 3, 4))?
        .reshape((b, out_dim, f * pt, hh, ww))
}

/// Replicate-pad the trailing edges of `[B, C, T, H, W]` up to multiples of `kernel`.
pub fn pad_for_3d_conv(x: &Tensor, kernel: [usize; 3]) -> Result<Tensor> {
    let (_, _, t, h, w) = x.dims5()?;
    let pad = |len: usize, k: usize| (k - len % k) % k;
    x.pad_with_same(2, 0, pad(t, kernel[0]))?
        .pad_with_same(3, 0, pad(h, kernel[1]))?
        .pad_with_same(4, 0, pad(w, kernel[2]))
}

// ===========================================================================
// Clean latent embedder
// ===========================================================================

/// Compression level of a clean context latent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanScale {
    X1,
    X2,
    X4,
}

impl CleanScale {
    pub fn kernel(self) -> [usize; 3] {
        match self {
            CleanScale::X1 => [1, 2, 2],
            CleanScale::X2 => [2, 4, 4],
            CleanScale::X4 => [4, 8, 8],
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            CleanScale::X1 => "1x",
            CleanScale::X2 => "2x",
            CleanScale::X4 => "4x",
        }
    }
}

impl FromStr for CleanScale {
    type Err = AssemblyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1x" => Ok(CleanScale::X1),
            "2x" => Ok(CleanScale::X2),
            "4x" => Ok(CleanScale::X4),
            other => Err(AssemblyError::UnsupportedScale(other.to_string())),
        }
    }
}

/// Weight names: `proj`, `proj_2x`, `proj_4x`
#[derive(Debug, Clone)]
pub struct CleanLatentEmbedder {
    proj: PatchEmbedding,
    proj_2x: PatchEmbedding,
    proj_4x: PatchEmbedding,
}

impl CleanLatentEmbedder {
    pub fn new(in_channels: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: PatchEmbedding::new(in_channels, dim, CleanScale::X1.kernel(), vb.pp("proj"))?,
            proj_2x: PatchEmbedding::new(in_channels, dim, CleanScale::X2.kernel(), vb.pp("proj_2x"))?,
            proj_4x: PatchEmbedding::new(in_channels, dim, CleanScale::X4.kernel(), vb.pp("proj_4x"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, scale: CleanScale) -> Result<(Tensor, PatchGrid)> {
        match scale {
            CleanScale::X1 => self.proj.forward(x),
            CleanScale::X2 => self.proj_2x.forward(x),
            CleanScale::X4 => self.proj_4x.forward(x),
        }
    }
}

// ===========================================================================
// Assembler
// ===========================================================================

/// A clean latent and the frame positions it stands for
#[derive(Debug, Clone, Copy)]
pub struct CleanLatentInput<'a> {
    /// `[B, C, T, H, W]`
    pub latents: &'a Tensor,
    /// `[B, n]` integer frame positions; entries `< 0` are unused slots
    pub indices: &'a Tensor,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyInputs<'a> {
    /// `[B, f]` frame positions of the primary latent, `0..f` when absent
    pub latent_indices: Option<&'a Tensor>,
    pub clean_1x: Option<CleanLatentInput<'a>>,
    pub clean_2x: Option<CleanLatentInput<'a>>,
    pub clean_4x: Option<CleanLatentInput<'a>>,
    /// `[B, frames, cam_dim]`
    pub cam_emb: Option<&'a Tensor>,
}

/// One contiguous run of the assembled sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// `None` for the primary latent
    pub scale: Option<CleanScale>,
    pub grid: PatchGrid,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct AssembledSequence {
    /// `[B, S, dim]`
    pub tokens: Tensor,
    pub freqs: RopeFreqs,
    /// `[B, S, cam_dim]`
    pub cam_emb: Option<Tensor>,
    /// Primary latent grid
    pub grid: PatchGrid,
    /// Segments in sequence order, the primary last
    pub segments: Vec<Segment>,
}

impl AssembledSequence {
    pub fn seq_len(&self) -> Result<usize> {
        self.tokens.dim(1)
    }
}

fn index_rows(t: &Tensor) -> Result<Vec<Vec<i64>>> {
    let t = t.to_dtype(DType::I64)?;
    match t.rank() {
        1 => Ok(vec![t.to_vec1::<i64>()?]),
        _ => t.to_vec2::<i64>(),
    }
}

fn non_negative(values: &[i64], what: &'static str) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| AssemblyError::NegativeIndex { what, index: v }.into())
        })
        .collect()
}

/// `[B, F, D]` → `[B, F*h*w, D]`, every frame row repeated over the grid.
fn spread_camera(cam: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (b, f, d) = cam.dims3()?;
    cam.reshape((b, f, 1, d))?
        .broadcast_as((b, f, h * w, d))?
        .reshape((b, f * h * w, d))
}

fn camera_rows(cam: &Tensor, start: i64, end: i64) -> Result<Tensor> {
    let len = cam.dim(1)?;
    if start < 0 || end < start || end as usize > len {
        return Err(AssemblyError::CameraOutOfRange { start, end, len }.into());
    }
    cam.narrow(1, start as usize, (end - start) as usize)
}

/// Patch embedding, clean latent embedders and the assembly procedure
#[derive(Debug, Clone)]
pub struct MultiScaleTokenAssembler {
    patch_embedding: PatchEmbedding,
    clean_x_embedder: Option<CleanLatentEmbedder>,
}

impl MultiScaleTokenAssembler {
    pub fn new(patch_embedding: PatchEmbedding, clean_x_embedder: Option<CleanLatentEmbedder>) -> Self {
        Self {
            patch_embedding,
            clean_x_embedder,
        }
    }

    pub fn patch_embedding(&self) -> &PatchEmbedding {
        &self.patch_embedding
    }

    fn clean_embedder(&self) -> Result<&CleanLatentEmbedder> {
        match &self.clean_x_embedder {
            Some(e) => Ok(e),
            None => candle_core::bail!("clean latents supplied but the model has no clean_x_embedder"),
        }
    }

    pub fn assemble(
        &self,
        latents: &Tensor,
        rope: &RotaryFrequencyTable,
        inputs: &AssemblyInputs<'_>,
    ) -> Result<AssembledSequence> {
        let b = latents.dim(0)?;
        let (mut tokens, grid) = self.patch_embedding.forward(latents)?;
        let PatchGrid { f, h, w } = grid;

        // Primary frame positions, per batch row
        let latent_rows: Vec<Vec<usize>> = match inputs.latent_indices {
            Some(t) => index_rows(t)?
                .iter()
                .map(|r| non_negative(r, "latent"))
                .collect::<Result<_>>()?,
            None => vec![(0..f).collect()],
        };
        if latent_rows.len() != b && latent_rows.len() != 1 {
            return Err(AssemblyError::BatchMismatch {
                rows: latent_rows.len(),
                batch: b,
            }
            .into());
        }
        let mut freqs = if latent_rows.len() == 1 {
            rope.grid(&latent_rows[0], h, w)?.broadcast_batch(b)?
        } else {
            let per_batch = latent_rows
                .iter()
                .map(|r| rope.grid(r, h, w))
                .collect::<Result<Vec<_>>>()?;
            RopeFreqs::stack(&per_batch)?
        };

        let clean_1x_rows = match &inputs.clean_1x {
            Some(c) => Some(index_rows(c.indices)?),
            None => None,
        };
        let start = clean_1x_rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|r| r.first())
            .copied()
            .unwrap_or(0);

        let mut camera = match inputs.cam_emb {
            Some(cam) => {
                let first = &latent_rows[0];
                let lo = first.iter().copied().min().unwrap_or(0) as i64;
                let hi = first.iter().copied().max().map_or(0, |m| m as i64 + 1);
                let rows = camera_rows(cam, lo - start, hi - start)?;
                Some(spread_camera(&rows, h, w)?)
            }
            None => None,
        };

        let mut segments = vec![Segment {
            scale: None,
            grid,
            len: grid.tokens(),
        }];

        // 1x: own index list, primary spatial grid
        if let (Some(clean), Some(rows)) = (&inputs.clean_1x, &clean_1x_rows) {
            let embedder = self.clean_embedder()?;
            let x = clean.latents.to_dtype(tokens.dtype())?;
            let (clean_tokens, clean_grid) = embedder.forward(&x, CleanScale::X1)?;

            let per_batch = rows
                .iter()
                .map(|r| rope.grid(&non_negative(r, "clean 1x")?, h, w))
                .collect::<Result<Vec<_>>>()?;
            let clean_freqs = if per_batch.len() == 1 {
                per_batch[0].broadcast_batch(b)?
            } else {
                RopeFreqs::stack(&per_batch)?
            };

            if let (Some(cam), Some(acc)) = (inputs.cam_emb, camera.take()) {
                let first = rows.first().map(|r| r.as_slice()).unwrap_or(&[]);
                let lo = first.iter().copied().min().unwrap_or(0) - start;
                let hi = first.iter().copied().max().unwrap_or(0) + 1 - start;
                let picked = if lo == hi {
                    camera_rows(cam, lo, lo + 1)?
                } else {
                    let len = cam.dim(1)?;
                    if lo < 0 || hi < 0 || hi as usize >= len {
                        return Err(AssemblyError::CameraOutOfRange { start: lo, end: hi, len }.into());
                    }
                    let ids = Tensor::new(&[lo as u32, hi as u32], cam.device())?;
                    cam.index_select(&ids, 1)?
                };
                let front = spread_camera(&picked, h, w)?;
                camera = Some(Tensor::cat(&[&front, &acc.to_dtype(front.dtype())?], 1)?);
            }

            tokens = Tensor::cat(&[&clean_tokens, &tokens], 1)?;
            freqs = freqs.prepend(&clean_freqs)?;
            segments.insert(
                0,
                Segment {
                    scale: Some(CleanScale::X1),
                    grid: clean_grid,
                    len: clean_grid.tokens(),
                },
            );
        }

        // 2x, then 4x: valid indices flattened across the batch
        for (scale, input) in [
            (CleanScale::X2, &inputs.clean_2x),
            (CleanScale::X4, &inputs.clean_4x),
        ] {
            let Some(clean) = input else { continue };
            let valid: Vec<i64> = index_rows(clean.indices)?
                .into_iter()
                .flatten()
                .filter(|&i| i >= 0)
                .collect();
            let Some(&last) = valid.last() else {
                tracing::debug!(scale = scale.tag(), "no valid clean latent indices, skipping");
                continue;
            };

            let embedder = self.clean_embedder()?;
            let x = pad_for_3d_conv(&clean.latents.to_dtype(tokens.dtype())?, scale.kernel())?;
            let (clean_tokens, g) = embedder.forward(&x, scale)?;

            let frames: Vec<usize> = (0..g.f)
                .map(|j| valid.get(j).copied().unwrap_or(last) as usize)
                .collect();
            let clean_freqs = rope.grid(&frames, g.h, g.w)?;

            if let (Some(cam), Some(acc)) = (inputs.cam_emb, camera.take()) {
                let (cb, cam_len, cam_dim) = cam.dims3()?;
                let zeros = Tensor::zeros((cb, 1, cam_dim), cam.dtype(), cam.device())?;
                let mut rows = Vec::with_capacity(g.f);
                for j in 0..g.f {
                    let idx = if j < valid.len() { valid[j] - start } else { -1 };
                    if idx >= 0 && (idx as usize) < cam_len {
                        rows.push(cam.narrow(1, idx as usize, 1)?);
                    } else {
                        rows.push(zeros.clone());
                    }
                }
                let picked = Tensor::cat(&rows, 1)?;
                let front = spread_camera(&picked, g.h, g.w)?;
                camera = Some(Tensor::cat(&[&front, &acc.to_dtype(front.dtype())?], 1)?);
            }

            tokens = Tensor::cat(&[&clean_tokens, &tokens], 1)?;
            freqs = freqs.prepend(&clean_freqs)?;
            segments.insert(
                0,
                Segment {
                    scale: Some(scale),
                    grid: g,
                    len: g.tokens(),
                },
            );
        }

        let seq = tokens.dim(1)?;
        let rope_len = freqs.seq_len()?;
        if seq != rope_len {
            return Err(AssemblyError::RopeLengthMismatch {
                tokens: seq,
                freqs: rope_len,
            }
            .into());
        }
        if let Some(cam) = &camera {
            let cam_len = cam.dim(1)?;
            if cam_len != seq {
                return Err(AssemblyError::CameraLengthMismatch {
                    tokens: seq,
                    camera: cam_len,
                }
                .into());
            }
        }
        tracing::debug!(
            seq_len = seq,
            segments = segments.len(),
            primary = grid.tokens(),
            "assembled token sequence"
        );

        Ok(AssembledSequence {
            tokens,
            freqs,
            cam_emb: camera,
            grid,
            segments,
        })
    }
}
