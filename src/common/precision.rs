//! Precision boundary
//!
//! Several layers compute in a dtype that differs from the caller's: norms
//! upcast half precision to f32, rotary embeddings rotate in f64, and expert
//! linears run in their weight dtype. [`PrecisionBoundary`] is the single place
//! where a tensor enters such a region and leaves it again in the caller's dtype.

use candle_core::{DType, Device, Result, Tensor};

/// Records the caller's dtype on entry and restores it on exit.
#[derive(Debug, Clone, Copy)]
pub struct PrecisionBoundary {
    caller: DType,
    compute: DType,
}

impl PrecisionBoundary {
    pub fn new(caller: DType, compute: DType) -> Self {
        Self { caller, compute }
    }

    /// Boundary that keeps f32/f64 inputs as they are and lifts F16/BF16 to F32.
    pub fn upcast_half(caller: DType) -> Self {
        let compute = match caller {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        Self { caller, compute }
    }

    pub fn caller(&self) -> DType {
        self.caller
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn enter(&self, x: &Tensor) -> Result<Tensor> {
        x.to_dtype(self.compute)
    }

    pub fn exit(&self, y: &Tensor) -> Result<Tensor> {
        y.to_dtype(self.caller)
    }

    /// Run `f` inside the boundary.
    pub fn run<F>(&self, x: &Tensor, f: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        let y = f(&self.enter(x)?)?;
        self.exit(&y)
    }
}

/// Widest float dtype the device supports for rotary math.
pub fn extended_precision(device: &Device) -> DType {
    match device {
        Device::Metal(_) => DType::F32,
        _ => DType::F64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_restores_caller_dtype() -> Result<()> {
        let x = Tensor::ones((2, 3), DType::BF16, &Device::Cpu)?;
        let boundary = PrecisionBoundary::upcast_half(x.dtype());
        let y = boundary.run(&x, |t| {
            assert_eq!(t.dtype(), DType::F32);
            t.affine(2.0, 0.0)
        })?;
        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(y.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?, 12.0);
        Ok(())
    }

    #[test]
    fn test_extended_precision_on_cpu() {
        assert_eq!(extended_precision(&Device::Cpu), DType::F64);
    }
}
