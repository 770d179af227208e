//! Grouped-query attention with rotary positions and caller-owned caching.
//!
//! The component owns its projections: queries expand to
//! `num_heads * head_dim`, keys and values to `num_kv_groups * head_dim`, and
//! the merged heads contract back to the residual width. Keys and values are
//! appended to the cache before rotation (the cache stores raw tensors and
//! the full concatenated key sequence is re-rotated each call), so the
//! appended cache is exactly the value returned to the caller. Scores are
//! computed in `f32`, forbidden pairs are replaced by `-inf`, and the output
//! is cast back to the storage dtype.

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::ops::softmax_last_dim;
use embedding::RopeTable;
use layers::{
    checks, Linear, LinearConfig, LinearInit, NormConfig, PrecisionPolicy, RmsNorm,
};

use crate::core::AttentionConfig;
use crate::kv_cache::LayerCache;
use crate::masks::MASK_DTYPE;

/// Grouped-query attention layer.
#[derive(Debug, Clone)]
pub struct GroupedQueryAttention {
    config: AttentionConfig,
    policy: PrecisionPolicy,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
}

impl GroupedQueryAttention {
    /// Assembles the layer from pre-built projections and optional per-head
    /// query/key norms. Configuration violations are fatal here, before any
    /// forward call.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: AttentionConfig,
        dtype: DType,
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        out_proj: Linear,
        q_norm: Option<RmsNorm>,
        k_norm: Option<RmsNorm>,
    ) -> Result<Self> {
        config.validate()?;

        let q_dim = config.num_heads * config.head_dim;
        let kv_dim = config.num_kv_groups * config.head_dim;
        for (name, proj, in_dim, out_dim) in [
            ("attention.q_proj", &q_proj, config.hidden_dim, q_dim),
            ("attention.k_proj", &k_proj, config.hidden_dim, kv_dim),
            ("attention.v_proj", &v_proj, config.hidden_dim, kv_dim),
            ("attention.out_proj", &out_proj, q_dim, config.hidden_dim),
        ] {
            let cfg = proj.config();
            if cfg.input_dim != in_dim || cfg.output_dim != out_dim {
                bail!(
                    "{name} expected {in_dim} -> {out_dim}, got {} -> {}",
                    cfg.input_dim,
                    cfg.output_dim
                );
            }
            if cfg.bias {
                bail!("{name} must be bias-free");
            }
        }

        match (config.qk_norm, &q_norm, &k_norm) {
            (true, Some(q), Some(k)) => {
                if q.config().size != config.head_dim || k.config().size != config.head_dim {
                    bail!("query/key norms must cover head_dim {}", config.head_dim);
                }
            }
            (false, None, None) => {}
            _ => bail!("qk_norm flag and supplied norms disagree"),
        }

        Ok(Self {
            config,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            q_norm,
            k_norm,
        })
    }

    /// Builds the layer with freshly initialised projections.
    pub fn with_init(
        config: AttentionConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let q_dim = config.num_heads * config.head_dim;
        let kv_dim = config.num_kv_groups * config.head_dim;
        let q_proj = Linear::with_init(
            LinearConfig::new(config.hidden_dim, q_dim),
            init,
            device,
            dtype,
        )?;
        let k_proj = Linear::with_init(
            LinearConfig::new(config.hidden_dim, kv_dim),
            init,
            device,
            dtype,
        )?;
        let v_proj = Linear::with_init(
            LinearConfig::new(config.hidden_dim, kv_dim),
            init,
            device,
            dtype,
        )?;
        let out_proj = Linear::with_init(
            LinearConfig::new(q_dim, config.hidden_dim),
            init,
            device,
            dtype,
        )?;

        let (q_norm, k_norm) = if config.qk_norm {
            let mut norm_cfg = NormConfig::new(config.head_dim);
            norm_cfg.epsilon = config.norm_eps;
            let zeros = Tensor::zeros(config.head_dim, dtype, device)?;
            (
                Some(RmsNorm::new(zeros.clone(), norm_cfg.clone())?),
                Some(RmsNorm::new(zeros, norm_cfg)?),
            )
        } else {
            (None, None)
        };

        Self::from_parts(config, dtype, q_proj, k_proj, v_proj, out_proj, q_norm, k_norm)
    }

    /// Returns the layer configuration.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Computes attention for `x` shaped `(batch, seq, hidden)`.
    ///
    /// `mask` is a boolean `(seq, cached + seq)` matrix (nonzero = forbidden)
    /// over the trailing key positions. `start_pos` is the absolute position
    /// of the first new token; `cache` holds the layer's un-rotated history.
    /// Returns the attention output (same shape as `x`) and the appended
    /// cache, whose length is always `cached + seq`; window truncation is
    /// the caller's responsibility.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        rope: &RopeTable,
        start_pos: usize,
        cache: Option<&LayerCache>,
    ) -> Result<(Tensor, LayerCache)> {
        checks::expect_batch_seq_hidden("attention.input", x, self.config.hidden_dim)?;
        let (batch, seq, _) = x.dims3()?;
        let heads = self.config.num_heads;
        let kv_groups = self.config.num_kv_groups;
        let head_dim = self.config.head_dim;

        let mut q = self
            .q_proj
            .forward(x, &self.policy)?
            .reshape((batch, seq, heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut k = self
            .k_proj
            .forward(x, &self.policy)?
            .reshape((batch, seq, kv_groups, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x, &self.policy)?
            .reshape((batch, seq, kv_groups, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        if let Some(norm) = &self.q_norm {
            q = norm.forward(&q, &self.policy)?;
        }
        if let Some(norm) = &self.k_norm {
            k = norm.forward(&k, &self.policy)?;
        }

        let prev_len = cache.map(LayerCache::seq_len).unwrap_or(0);
        if prev_len > start_pos {
            bail!(
                "cache holds {prev_len} positions but decoding starts at {start_pos}"
            );
        }
        let appended = LayerCache::append(cache, &k, &v)?;
        let total_len = appended.seq_len();

        checks::expect_shape("attention.mask", mask, &[seq, total_len])?;
        checks::expect_dtype_in("attention.mask", mask, &[MASK_DTYPE])?;

        // Queries rotate at their absolute position; the concatenated keys
        // rotate at the absolute position of their first (possibly cached)
        // entry.
        let q = rope.rotate(&q, start_pos)?;
        let keys = rope.rotate(appended.keys(), start_pos - prev_len)?;

        let q = (q * self.config.query_scale())?;

        let group_size = self.config.group_size();
        let keys = repeat_kv(keys, group_size)?;
        let values = repeat_kv(appended.values().clone(), group_size)?;

        let q_work = self.policy.cast_for_matmul(&q)?.contiguous()?;
        let k_work = self.policy.cast_for_matmul(&keys)?.contiguous()?;
        let v_work = self.policy.cast_for_matmul(&values)?.contiguous()?;

        let mut scores = q_work.matmul(&k_work.transpose(2, 3)?.contiguous()?)?;
        let forbidden = mask
            .reshape((1, 1, seq, total_len))?
            .broadcast_as(scores.dims())?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
            .to_dtype(scores.dtype())?;
        scores = forbidden.where_cond(&neg_inf, &scores)?;

        let probs = softmax_last_dim(&scores)?;
        let context = probs.matmul(&v_work)?;

        let merged = context
            .transpose(1, 2)?
            .reshape((batch, seq, heads * head_dim))?;
        let merged = self.policy.cast_to_storage(&merged)?;
        let output = self.out_proj.forward(&merged, &self.policy)?;

        Ok((output, appended))
    }
}

/// Expands grouped key/value heads so each query head sees its shared head.
fn repeat_kv(x: Tensor, group_size: usize) -> Result<Tensor> {
    if group_size == 1 {
        return Ok(x);
    }
    let (batch, kv_heads, seq, head_dim) = x.dims4()?;
    Tensor::cat(&vec![&x; group_size], 2)?.reshape((batch, kv_heads * group_size, seq, head_dim))
}
