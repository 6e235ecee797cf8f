//! 3D rotary position embedding over (frame, height, width)
//!
//! The head dimension is split into three axis bands. Each band owns
//! `width / 2` complex frequencies `theta^(-2k / width)`; a token at
//! `(t, h, w)` rotates consecutive channel pairs by `t * f_time`,
//! `h * f_height` and `w * f_width` respectively.
//!
//! Tables are built once in f64 and uploaded in the device's widest float
//! dtype; rotation runs in that dtype and returns in the caller's dtype.

use candle_core::{DType, Device, Result, Tensor};

use crate::common::precision::{PrecisionBoundary, extended_precision};

pub const ROPE_THETA: f64 = 10000.0;

/// Rotary axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Time = 0,
    Height = 1,
    Width = 2,
}

#[derive(Debug, Clone)]
struct AxisTable {
    freqs: Vec<f64>,
    /// (max_positions, freqs.len())
    cos: Tensor,
    sin: Tensor,
}

impl AxisTable {
    fn new(width: usize, max_positions: usize, dtype: DType, device: &Device) -> Result<Self> {
        let freqs: Vec<f64> = (0..width / 2)
            .map(|k| 1.0 / ROPE_THETA.powf((2 * k) as f64 / width as f64))
            .collect();
        let n = freqs.len();
        let mut cos = Vec::with_capacity(max_positions * n);
        let mut sin = Vec::with_capacity(max_positions * n);
        for p in 0..max_positions {
            for f in &freqs {
                let angle = p as f64 * f;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        let cos = Tensor::from_vec(cos, (max_positions, n), device)?.to_dtype(dtype)?;
        let sin = Tensor::from_vec(sin, (max_positions, n), device)?.to_dtype(dtype)?;
        Ok(Self { freqs, cos, sin })
    }
}

/// Per-axis rotary frequencies up to a maximum extent
#[derive(Debug, Clone)]
pub struct RotaryFrequencyTable {
    head_dim: usize,
    max_positions: usize,
    axes: [AxisTable; 3],
    dtype: DType,
}

impl RotaryFrequencyTable {
    /// Frequency table for `head_dim` channels and positions `0..max_positions`.
    ///
    /// Band widths are whole complex pairs (see [`Self::axis_widths`]). When
    /// `head_dim / 3` is odd the spatial bands round down to the even width
    /// below it: head_dim 16 splits as [8, 4, 4], not [6, 5, 5].
    pub fn new(head_dim: usize, max_positions: usize, device: &Device) -> Result<Self> {
        if head_dim % 2 != 0 {
            candle_core::bail!("rotary head dimension {head_dim} must be even");
        }
        let dtype = extended_precision(device);
        let [t, h, w] = Self::axis_widths(head_dim);
        let axes = [
            AxisTable::new(t, max_positions, dtype, device)?,
            AxisTable::new(h, max_positions, dtype, device)?,
            AxisTable::new(w, max_positions, dtype, device)?,
        ];
        Ok(Self {
            head_dim,
            max_positions,
            axes,
            dtype,
        })
    }

    /// Channel widths of the (time, height, width) bands.
    ///
    /// Height and width take `head_dim / 3` rounded down to an even number of
    /// channels, time takes the rest, so the bands always tile the head.
    pub fn axis_widths(head_dim: usize) -> [usize; 3] {
        let pairs = head_dim / 2;
        let spatial = pairs / 3;
        [2 * (pairs - 2 * spatial), 2 * spatial, 2 * spatial]
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn frequencies(&self, axis: Axis) -> &[f64] {
        &self.axes[axis as usize].freqs
    }

    /// Rotation angle of frequency `k` on `axis` at `position`.
    pub fn angle(&self, axis: Axis, position: usize, k: usize) -> f64 {
        position as f64 * self.axes[axis as usize].freqs[k]
    }

    fn check_extent(&self, what: &str, value: usize) -> Result<()> {
        if value > self.max_positions {
            candle_core::bail!(
                "{what} {value} exceeds rotary table extent {}",
                self.max_positions
            );
        }
        Ok(())
    }

    /// Frequencies for a grid whose frames sit at `frames` and whose rows and
    /// columns run `0..h` and `0..w`. Returns shape `[1, F*h*w, 1, head_dim/2]`.
    pub fn grid(&self, frames: &[usize], h: usize, w: usize) -> Result<RopeFreqs> {
        self.check_extent("grid height", h)?;
        self.check_extent("grid width", w)?;
        if let Some(&p) = frames.iter().max()
            && p >= self.max_positions
        {
            candle_core::bail!(
                "frame position {p} is outside rotary table extent {}",
                self.max_positions
            );
        }
        let f = frames.len();
        let device = self.axes[0].cos.device();
        let frame_ids = Tensor::from_vec(
            frames.iter().map(|&p| p as u32).collect::<Vec<_>>(),
            f,
            device,
        )?;

        let [t, h_axis, w_axis] = &self.axes;
        Ok(RopeFreqs {
            cos: grid_band([&t.cos, &h_axis.cos, &w_axis.cos], &frame_ids, h, w)?,
            sin: grid_band([&t.sin, &h_axis.sin, &w_axis.sin], &frame_ids, h, w)?,
        })
    }
}

fn grid_band(tables: [&Tensor; 3], frame_ids: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let f = frame_ids.dim(0)?;
    let t = tables[0].index_select(frame_ids, 0)?;
    let tn = t.dim(1)?;
    let t = t.reshape((f, 1, 1, tn))?.broadcast_as((f, h, w, tn))?;
    let hh = tables[1].narrow(0, 0, h)?;
    let hn = hh.dim(1)?;
    let hh = hh.reshape((1, h, 1, hn))?.broadcast_as((f, h, w, hn))?;
    let ww = tables[2].narrow(0, 0, w)?;
    let wn = ww.dim(1)?;
    let ww = ww.reshape((1, 1, w, wn))?.broadcast_as((f, h, w, wn))?;
    Tensor::cat(&[t, hh, ww], 3)?.reshape((1, f * h * w, 1, tn + hn + wn))
}

/// Per-token rotary frequencies, stored as `cos`/`sin` of shape `[B, S, 1, head_dim/2]`
#[derive(Debug, Clone)]
pub struct RopeFreqs {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl RopeFreqs {
    pub fn seq_len(&self) -> Result<usize> {
        self.cos.dim(1)
    }

    pub fn batch(&self) -> Result<usize> {
        self.cos.dim(0)
    }

    /// Stack single-batch frequencies along the batch axis.
    pub fn stack(items: &[RopeFreqs]) -> Result<Self> {
        let cos: Vec<_> = items.iter().map(|r| r.cos.clone()).collect();
        let sin: Vec<_> = items.iter().map(|r| r.sin.clone()).collect();
        Ok(Self {
            cos: Tensor::cat(&cos, 0)?,
            sin: Tensor::cat(&sin, 0)?,
        })
    }

    pub fn broadcast_batch(&self, b: usize) -> Result<Self> {
        let (_, s, one, half) = self.cos.dims4()?;
        Ok(Self {
            cos: self.cos.broadcast_as((b, s, one, half))?.contiguous()?,
            sin: self.sin.broadcast_as((b, s, one, half))?.contiguous()?,
        })
    }

    /// `[front][self]` along the sequence axis.
    pub fn prepend(&self, front: &RopeFreqs) -> Result<Self> {
        let b = self.batch()?.max(front.batch()?);
        let (front, back) = (front.broadcast_batch(b)?, self.broadcast_batch(b)?);
        Ok(Self {
            cos: Tensor::cat(&[&front.cos, &back.cos], 1)?,
            sin: Tensor::cat(&[&front.sin, &back.sin], 1)?,
        })
    }

    /// Rotation by the negated angles.
    pub fn inverse(&self) -> Result<Self> {
        Ok(Self {
            cos: self.cos.clone(),
            sin: self.sin.neg()?,
        })
    }
}

/// Rotate `x` of shape `[B, S, N * Dh]` by `freqs`.
pub fn apply_rope(x: &Tensor, freqs: &RopeFreqs, num_heads: usize) -> Result<Tensor> {
    let (b, s, width) = x.dims3()?;
    if num_heads == 0 || width % num_heads != 0 {
        candle_core::bail!("rope width {width} is not divisible by {num_heads} heads");
    }
    let half = width / num_heads / 2;
    let (fb, fs, _, fh) = freqs.cos.dims4()?;
    if fs != s || fh != half || (fb != b && fb != 1) {
        candle_core::bail!(
            "rope frequencies [{fb}, {fs}, 1, {fh}] do not match tokens [{b}, {s}] with {half} pairs per head"
        );
    }

    let boundary = PrecisionBoundary::new(x.dtype(), freqs.cos.dtype());
    boundary.run(x, |x| {
        let x = x.reshape((b, s, num_heads, half, 2))?;
        let re = x.narrow(4, 0, 1)?.squeeze(4)?;
        let im = x.narrow(4, 1, 1)?.squeeze(4)?;
        let cos = freqs.cos.broadcast_as((b, s, num_heads, half))?;
        let sin = freqs.sin.broadcast_as((b, s, num_heads, half))?;
        let out_re = (re.mul(&cos)? - im.mul(&sin)?)?;
        let out_im = (re.mul(&sin)? + im.mul(&cos)?)?;
        Tensor::stack(&[out_re, out_im], 4)?.reshape((b, s, width))
    })
}
