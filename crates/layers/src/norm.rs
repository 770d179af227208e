//! Root-mean-square normalization with a zero-centered learnable scale.
//!
//! Normalization happens along the last axis and accepts any rank whose
//! trailing dimension matches the configured size, so the same layer serves
//! `(batch, seq, hidden)` activations and `(batch, heads, seq, head_dim)`
//! per-head query/key states. Statistics are accumulated in
//! [`PrecisionPolicy::reduction`] before the output is cast back to storage.
//!
//! The learnable scale is a zero-centered offset: the output is
//! `normalized * (1 + weight)`, optionally `+ shift`. Weight sources that
//! store a plain multiplier must be adapted during ingestion; this layer
//! never re-interprets its parameters.

use candle_core::{DType, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for RMS normalization layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Width of the axis being normalised.
    pub size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the default epsilon.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            epsilon: 1e-6,
        }
    }
}

/// RMS norm with zero-centered scale and optional shift.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
    shift: Option<Tensor>,
}

impl RmsNorm {
    /// Constructs an RMS norm from a zero-centered scale parameter.
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        Self::build(weight, None, config)
    }

    /// Constructs an RMS norm with both a zero-centered scale and a shift.
    pub fn with_shift(weight: Tensor, shift: Tensor, config: NormConfig) -> Result<Self> {
        Self::build(weight, Some(shift), config)
    }

    fn build(weight: Tensor, shift: Option<Tensor>, config: NormConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::Msg("norm size must be non-zero".into()));
        }
        checks::expect_shape("norm.weight", &weight, &[config.size])?;
        checks::expect_dtype_in(
            "norm.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("norm.weight", &weight)?;
        if let Some(shift) = &shift {
            checks::expect_shape("norm.shift", shift, &[config.size])?;
            checks::expect_contiguous("norm.shift", shift)?;
        }
        Ok(Self {
            config,
            weight,
            shift,
        })
    }

    /// Returns the configuration so callers can check compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Applies the normalization along the last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.size)?;

        let size = self.config.size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        let scale = (self.weight.to_dtype(normalized.dtype())? + 1.0)?;
        normalized = normalized.broadcast_mul(&scale)?;
        if let Some(shift) = &self.shift {
            let shift = shift.to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_add(&shift)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
