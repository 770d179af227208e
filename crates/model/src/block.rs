use attention::kv_cache::LayerCache;
use attention::{AttentionKind, GroupedQueryAttention};
use candle_core::{Error, Result, Tensor};
use embedding::RopeTable;
use layers::{
    FeedForward, FeedForwardConfig, LinearInit, NormConfig, PrecisionPolicy, RmsNorm,
};

use crate::config::ModelConfig;

pub(crate) fn build_norm(config: &ModelConfig) -> Result<RmsNorm> {
    let mut norm_cfg = NormConfig::new(config.hidden_dim);
    norm_cfg.epsilon = config.norm_eps;
    let weight = Tensor::zeros(config.hidden_dim, config.dtype, &config.device)?;
    RmsNorm::new(weight, norm_cfg)
}

/// Per-call inputs shared by every block of one forward pass.
///
/// Both mask flavors and both RoPE tables are carried because the attention
/// regime is interleaved per layer; each block selects its pair by tag.
pub struct BlockInputs<'a> {
    /// Causal mask over the full key prefix, for `Full` layers.
    pub full_mask: &'a Tensor,
    /// Window-bounded mask over the trailing keys, for `Sliding` layers.
    pub sliding_mask: &'a Tensor,
    /// Larger-period RoPE table used by `Full` layers.
    pub global_rope: &'a RopeTable,
    /// Smaller-period RoPE table used by `Sliding` layers.
    pub local_rope: &'a RopeTable,
    /// Absolute position of the first new token.
    pub start_pos: usize,
}

/// One decoder layer: sandwich-normalised attention and feed-forward
/// branches around residual additions, with a fixed attention regime.
#[derive(Debug)]
pub struct DecoderBlock {
    kind: AttentionKind,
    sliding_window: usize,
    policy: PrecisionPolicy,
    input_norm: RmsNorm,
    post_attention_norm: RmsNorm,
    pre_ff_norm: RmsNorm,
    post_ff_norm: RmsNorm,
    attention: GroupedQueryAttention,
    mlp: FeedForward,
}

impl DecoderBlock {
    /// Assembles a block from pre-built components.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: &ModelConfig,
        kind: AttentionKind,
        input_norm: RmsNorm,
        attention: GroupedQueryAttention,
        post_attention_norm: RmsNorm,
        pre_ff_norm: RmsNorm,
        mlp: FeedForward,
        post_ff_norm: RmsNorm,
    ) -> Result<Self> {
        for (name, norm) in [
            ("block.input_norm", &input_norm),
            ("block.post_attention_norm", &post_attention_norm),
            ("block.pre_ff_norm", &pre_ff_norm),
            ("block.post_ff_norm", &post_ff_norm),
        ] {
            if norm.config().size != config.hidden_dim {
                return Err(Error::Msg(format!(
                    "{name} normalises {} features, block carries {}",
                    norm.config().size,
                    config.hidden_dim
                )));
            }
        }
        if attention.config().hidden_dim != config.hidden_dim {
            return Err(Error::Msg(
                "attention layer does not match the block width".into(),
            ));
        }
        if mlp.config().hidden_size != config.hidden_dim {
            return Err(Error::Msg(
                "feed-forward layer does not match the block width".into(),
            ));
        }

        Ok(Self {
            kind,
            sliding_window: config.sliding_window,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
            input_norm,
            post_attention_norm,
            pre_ff_norm,
            post_ff_norm,
            attention,
            mlp,
        })
    }

    /// Builds layer `index` of the model with freshly initialised weights.
    pub fn with_init(index: usize, config: &ModelConfig) -> Result<Self> {
        let kind = *config
            .layer_types
            .get(index)
            .ok_or_else(|| Error::Msg(format!("no layer type for layer {index}")))?;

        let attention = GroupedQueryAttention::with_init(
            config.attention_config(),
            LinearInit::XavierUniform,
            &config.device,
            config.dtype,
        )?;
        let mlp = FeedForward::with_init(
            FeedForwardConfig::new(config.hidden_dim, config.intermediate_size),
            LinearInit::XavierUniform,
            &config.device,
            config.dtype,
        )?;

        Self::from_parts(
            config,
            kind,
            build_norm(config)?,
            attention,
            build_norm(config)?,
            build_norm(config)?,
            mlp,
            build_norm(config)?,
        )
    }

    /// The attention regime this layer was constructed with.
    pub fn kind(&self) -> AttentionKind {
        self.kind
    }

    /// Forward pass through the block.
    ///
    /// Returns the transformed hidden state and the layer's updated cache.
    /// Sliding layers hand back a cache already trimmed to the window;
    /// full layers hand back the unbounded appended cache.
    pub fn forward(
        &self,
        hidden: &Tensor,
        inputs: &BlockInputs<'_>,
        cache: Option<&LayerCache>,
    ) -> Result<(Tensor, LayerCache)> {
        let (mask, rope) = match self.kind {
            AttentionKind::Sliding => (inputs.sliding_mask, inputs.local_rope),
            AttentionKind::Full => (inputs.full_mask, inputs.global_rope),
        };

        let shortcut = hidden;
        let normed = self.input_norm.forward(hidden, &self.policy)?;
        let (attn, appended) = self
            .attention
            .forward(&normed, mask, rope, inputs.start_pos, cache)?;
        let attn = self.post_attention_norm.forward(&attn, &self.policy)?;
        let after_attn = (shortcut + attn)?;

        let ff = self.pre_ff_norm.forward(&after_attn, &self.policy)?;
        let ff = self.mlp.forward(&ff, &self.policy)?;
        let ff = self.post_ff_norm.forward(&ff, &self.policy)?;
        let output = (&after_attn + ff)?;

        let cache = match self.kind {
            AttentionKind::Sliding => appended.trim_to_recent(self.sliding_window)?,
            AttentionKind::Full => appended,
        };
        Ok((output, cache))
    }
}
