//! Precision and dtype policy shared by every layer in the stack.
//!
//! Parameters may be stored in `f16`/`bf16` for memory reasons while matmuls
//! and reductions promote to `f32`. [`PrecisionPolicy`] centralises those
//! casts so norms, projections, and attention agree on where widening and
//! narrowing happen: compute-heavy paths use [`PrecisionPolicy::compute`],
//! statistics use [`PrecisionPolicy::reduction`], and every public output is
//! cast back to [`PrecisionPolicy::storage`].

use candle_core::{DType, Result, Tensor};

/// Tolerances appropriate for comparisons at each stage of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for tensors held in parameter storage.
    pub storage: f32,
    /// Tolerance for intermediate matmul/activation results.
    pub compute: f32,
    /// Tolerance for statistics accumulated during reductions.
    pub reduction: f32,
}

/// Describes how tensors are cast during the phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Derives a policy from the dtype parameters are stored in.
    ///
    /// Reduced-precision storage promotes to `f32` for compute; reductions
    /// always run in `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Dtype used for parameters and public outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Dtype used for reductions such as normalization statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Whether any widening happens between storage and compute.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
            reduction: epsilon_for(self.reduction),
        }
    }

    /// Casts a tensor to the compute dtype ahead of a matmul.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype ahead of statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());
    }

    #[test]
    fn f32_policy_is_uniform() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert_eq!(policy.compute(), DType::F32);
        assert!(!policy.is_mixed_precision());
    }

    #[test]
    fn cast_round_trip_stays_within_storage_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let base = Tensor::from_vec(vec![0.5f32, -1.25, 2.0], (3,), &device)?;
        let stored = base.to_dtype(policy.storage())?;

        let widened = policy.cast_for_matmul(&stored)?;
        assert_eq!(widened.dtype(), policy.compute());

        let restored = policy.cast_to_storage(&widened)?.to_dtype(DType::F32)?;
        let eps = policy.epsilons().storage;
        for (orig, rest) in base
            .to_vec1::<f32>()?
            .iter()
            .zip(restored.to_vec1::<f32>()?.iter())
        {
            assert!((orig - rest).abs() <= eps);
        }
        Ok(())
    }
}
