use candle_core::{DType, Device, Result, Shape, Tensor};

/// PCG32 (XSH-RR) generator used for reproducible training noise
/// and timestep draws.
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, 54)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in `[0, 1)`
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Uniform integer in `0..bound` (Lemire rejection)
    pub fn next_below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let m = self.next_u32() as u64 * bound as u64;
            if (m as u32) >= threshold {
                return (m >> 32) as u32;
            }
        }
    }

    /// Two standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// Standard normal tensor of `shape` in `dtype`
    pub fn randn(&mut self, shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(n);
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }

    pub fn randn_like(&mut self, t: &Tensor) -> Result<Tensor> {
        self.randn(t.shape().clone(), t.dtype(), t.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = Pcg32::from_seed(7);
        let mut b = Pcg32::from_seed(7);
        for _ in 0..16 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_next_below_in_range() {
        let mut rng = Pcg32::from_seed(1);
        for _ in 0..1000 {
            assert!(rng.next_below(1000) < 1000);
        }
        assert_eq!(rng.next_below(1), 0);
    }

    #[test]
    fn test_randn_shape_and_moments() -> Result<()> {
        let mut rng = Pcg32::from_seed(3);
        let t = rng.randn((101, 99), DType::F32, &Device::Cpu)?;
        assert_eq!(t.dims(), &[101, 99]);
        let mean = t.mean_all()?.to_scalar::<f32>()?;
        assert!(mean.abs() < 0.05);
        Ok(())
    }
}
