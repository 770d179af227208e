//! Activation catalogue for transformer feed-forward stacks.
//!
//! Activations consume tensors of any layout and apply elementwise, promoting
//! to the compute dtype requested by [`PrecisionPolicy`] before evaluating the
//! non-linearity and casting back to storage afterwards.
//!
//! `GeluTanh` is the tanh-approximated GELU used by the gating branch of the
//! feed-forward blocks (`Tensor::gelu` in candle); `Gelu` is the exact
//! erf-based form kept for reference comparisons.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies an elementwise non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, useful when wiring custom stacks.
    Identity,
    /// GELU with the tanh approximation.
    GeluTanh,
    /// GELU with the exact erf formulation.
    Gelu,
    /// SiLU (a.k.a. swish).
    Silu,
}

impl ActivationKind {
    /// Applies the activation under the precision rules in `policy`.
    pub fn apply(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::GeluTanh => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu()?)
            }
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
            ActivationKind::Silu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.silu()?)
            }
        }
    }
}
