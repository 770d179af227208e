use attention::{AttentionConfig, AttentionKind};
use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the decoder-only transformer.
///
/// All values are immutable constants; the per-layer attention regime is
/// fixed by `layer_types`, one tag per layer.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub hidden_dim: usize,
    pub intermediate_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_groups: usize,
    pub head_dim: usize,
    pub layer_types: Vec<AttentionKind>,
    pub sliding_window: usize,
    /// RoPE base for sliding-window layers (smaller period).
    pub rope_local_base: f32,
    /// RoPE base for full-attention layers (larger period).
    pub rope_base: f32,
    pub norm_eps: f64,
    pub query_pre_attn_scalar: Option<f64>,
    pub qk_norm: bool,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    /// Validates structural invariants before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.context_length == 0 {
            return Err(Error::Msg(
                "context_length must be greater than zero".into(),
            ));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.intermediate_size == 0 {
            return Err(Error::Msg(
                "intermediate_size must be greater than zero".into(),
            ));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.layer_types.len() != self.n_layers {
            return Err(Error::Msg(format!(
                "layer_types lists {} entries for {} layers",
                self.layer_types.len(),
                self.n_layers
            )));
        }
        if self.sliding_window == 0 {
            return Err(Error::Msg("sliding_window must be at least 1".into()));
        }
        self.attention_config().validate()
    }

    /// Attention-side view of this configuration, shared by every layer.
    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            hidden_dim: self.hidden_dim,
            num_heads: self.n_heads,
            num_kv_groups: self.n_kv_groups,
            head_dim: self.head_dim,
            query_pre_attn_scalar: self.query_pre_attn_scalar,
            qk_norm: self.qk_norm,
            norm_eps: self.norm_eps,
        }
    }
}
