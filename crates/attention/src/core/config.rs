//! Configuration shared by the attention components.

use candle_core::{Error, Result};

/// Geometry and behaviour of one grouped-query attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Width of the residual stream entering and leaving the layer.
    pub hidden_dim: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of shared key/value heads; query heads map onto these in
    /// groups of `num_heads / num_kv_groups`.
    pub num_kv_groups: usize,
    /// Per-head dimensionality.
    pub head_dim: usize,
    /// Optional override for the query pre-scale denominator; queries are
    /// scaled by `1 / sqrt(query_pre_attn_scalar)` when set, else by
    /// `1 / sqrt(head_dim)`. A constant, never learned.
    pub query_pre_attn_scalar: Option<f64>,
    /// Whether queries and keys are RMS-normalised per head before rotation.
    pub qk_norm: bool,
    /// Epsilon used by the query/key norms.
    pub norm_eps: f64,
}

impl AttentionConfig {
    /// Validates structural invariants; violations are fatal before any
    /// forward call.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(Error::Msg("num_heads must be greater than zero".into()));
        }
        if self.num_kv_groups == 0 {
            return Err(Error::Msg(
                "num_kv_groups must be greater than zero".into(),
            ));
        }
        if self.num_heads % self.num_kv_groups != 0 {
            return Err(Error::Msg(format!(
                "num_heads ({}) must be divisible by num_kv_groups ({})",
                self.num_heads, self.num_kv_groups
            )));
        }
        if self.head_dim == 0 || self.head_dim % 2 != 0 {
            return Err(Error::Msg(format!(
                "head_dim must be even and non-zero, got {}",
                self.head_dim
            )));
        }
        if let Some(scalar) = self.query_pre_attn_scalar {
            if scalar <= 0.0 {
                return Err(Error::Msg(format!(
                    "query_pre_attn_scalar must be positive, got {scalar}"
                )));
            }
        }
        Ok(())
    }

    /// Number of query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_groups
    }

    /// The constant factor queries are multiplied by before scoring.
    pub fn query_scale(&self) -> f64 {
        1.0 / self
            .query_pre_attn_scalar
            .unwrap_or(self.head_dim as f64)
            .sqrt()
    }
}
