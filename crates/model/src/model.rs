use attention::kv_cache::LayerCache;
use attention::masks::{build_causal_mask, build_sliding_mask};
use candle_core::{bail, Error, Result, Tensor};
use embedding::{RopeTable, TokenEmbedding, TokenEmbeddingConfig};
use layers::{Linear, PrecisionPolicy, RmsNorm};

use crate::{
    block::{build_norm, BlockInputs, DecoderBlock},
    config::ModelConfig,
};

/// Caller-owned state for one generation episode.
///
/// Bundles the per-layer cache slots with the position counter so they can
/// only advance together. The model itself stays immutable across calls;
/// concurrent independent episodes each own a `DecodeState` while sharing one
/// model.
#[derive(Debug, Default)]
pub struct DecodeState {
    caches: Vec<Option<LayerCache>>,
    pos: usize,
}

impl DecodeState {
    /// Creates empty state for a model with `n_layers` layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            caches: (0..n_layers).map(|_| None).collect(),
            pos: 0,
        }
    }

    /// Absolute position the next token batch will decode at.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Number of layers this state tracks.
    pub fn n_layers(&self) -> usize {
        self.caches.len()
    }

    /// Read access to one layer's cache slot.
    pub fn layer_cache(&self, index: usize) -> Option<&LayerCache> {
        self.caches.get(index).and_then(Option::as_ref)
    }

    /// Clears all caches and rewinds the position counter.
    ///
    /// Must be called between unrelated generation episodes sharing one
    /// state value.
    pub fn reset(&mut self) {
        for slot in &mut self.caches {
            *slot = None;
        }
        self.pos = 0;
    }
}

/// Decoder-only transformer assembled from the shared crates.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    policy: PrecisionPolicy,
    embedding: TokenEmbedding,
    blocks: Vec<DecoderBlock>,
    final_norm: RmsNorm,
    /// Explicit readout projection; `None` ties the readout to the
    /// transposed embedding table.
    output_proj: Option<Linear>,
    rope_local: RopeTable,
    rope_global: RopeTable,
}

impl Model {
    /// Builds the model with freshly initialised weights.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let embedding = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size: config.vocab_size,
            hidden_dim: config.hidden_dim,
            dtype: config.dtype,
            device: config.device.clone(),
        })?;
        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            blocks.push(DecoderBlock::with_init(layer, &config)?);
        }
        let final_norm = build_norm(&config)?;
        Self::from_parts(config, embedding, blocks, final_norm, None)
    }

    /// Assembles the model from pre-built components.
    pub fn from_parts(
        config: ModelConfig,
        embedding: TokenEmbedding,
        blocks: Vec<DecoderBlock>,
        final_norm: RmsNorm,
        output_proj: Option<Linear>,
    ) -> Result<Self> {
        config.validate()?;
        if blocks.len() != config.n_layers {
            return Err(Error::Msg(format!(
                "model expects {} blocks, got {}",
                config.n_layers,
                blocks.len()
            )));
        }
        for (index, (block, kind)) in blocks.iter().zip(config.layer_types.iter()).enumerate() {
            if block.kind() != *kind {
                return Err(Error::Msg(format!(
                    "layer {index} is {:?} but the configuration expects {kind:?}",
                    block.kind()
                )));
            }
        }
        if let Some(proj) = &output_proj {
            let cfg = proj.config();
            if cfg.input_dim != config.hidden_dim || cfg.output_dim != config.vocab_size {
                return Err(Error::Msg(format!(
                    "output projection expected {} -> {}, got {} -> {}",
                    config.hidden_dim, config.vocab_size, cfg.input_dim, cfg.output_dim
                )));
            }
        }

        let rope_local = RopeTable::new(
            config.head_dim,
            config.rope_local_base,
            config.context_length,
            &config.device,
        )?;
        let rope_global = RopeTable::new(
            config.head_dim,
            config.rope_base,
            config.context_length,
            &config.device,
        )?;

        log::info!(
            "model init: layers={} heads={} kv_groups={} head_dim={} hidden={} window={} tied_output={}",
            config.n_layers,
            config.n_heads,
            config.n_kv_groups,
            config.head_dim,
            config.hidden_dim,
            config.sliding_window,
            output_proj.is_none(),
        );

        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
            embedding,
            blocks,
            final_norm,
            output_proj,
            rope_local,
            rope_global,
            config,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Creates a fresh decode state sized for this model.
    pub fn new_state(&self) -> DecodeState {
        DecodeState::new(self.config.n_layers)
    }

    /// Full pass over `token_ids` with no position memory.
    ///
    /// Produces logits shaped `(batch, seq, vocab_size)` for query rows
    /// `[0, seq)`; no cache is read or written.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.run(token_ids, None)
    }

    /// Incremental pass reusing and extending `state`.
    ///
    /// Decodes `token_ids` at absolute rows `[state.pos(), state.pos() + seq)`
    /// and advances the counter; per-layer caches are threaded independently
    /// and written back into `state`.
    pub fn forward_with_state(&self, token_ids: &Tensor, state: &mut DecodeState) -> Result<Tensor> {
        if state.n_layers() != self.config.n_layers {
            bail!(
                "decode state tracks {} layers, model has {}",
                state.n_layers(),
                self.config.n_layers
            );
        }
        self.run(token_ids, Some(state))
    }

    fn run(&self, token_ids: &Tensor, state: Option<&mut DecodeState>) -> Result<Tensor> {
        let (_batch, seq) = token_ids.dims2()?;
        let pos_start = state.as_ref().map(|s| s.pos).unwrap_or(0);
        let pos_end = pos_start + seq;
        if pos_end > self.config.context_length {
            bail!(
                "positions [{pos_start}, {pos_end}) exceed the context length {}",
                self.config.context_length
            );
        }

        let device = &self.config.device;
        let window = self.config.sliding_window;
        // The trim step keeps every sliding cache at min(pos, window)
        // entries, so the sliding mask width always matches the key count.
        let cached_sliding = pos_start.min(window);
        let full_mask = build_causal_mask(device, pos_start, pos_end, pos_end)?;
        let sliding_mask =
            build_sliding_mask(device, pos_start, pos_end, cached_sliding + seq, window)?;

        let mut hidden = self.embedding.forward(token_ids)?;
        // Scale by sqrt(hidden) to keep the residual stream magnitude
        // invariant to the embedding width.
        hidden = (hidden * (self.config.hidden_dim as f64).sqrt())?;

        let inputs = BlockInputs {
            full_mask: &full_mask,
            sliding_mask: &sliding_mask,
            global_rope: &self.rope_global,
            local_rope: &self.rope_local,
            start_pos: pos_start,
        };

        match state {
            Some(state) => {
                for (index, block) in self.blocks.iter().enumerate() {
                    let (next, cache) =
                        block.forward(&hidden, &inputs, state.caches[index].as_ref())?;
                    hidden = next;
                    state.caches[index] = Some(cache);
                }
                state.pos = pos_end;
            }
            None => {
                for block in &self.blocks {
                    let (next, _) = block.forward(&hidden, &inputs, None)?;
                    hidden = next;
                }
            }
        }

        let normalized = self.final_norm.forward(&hidden, &self.policy)?;
        let logits = match &self.output_proj {
            Some(proj) => proj.forward(&normalized, &self.policy)?,
            None => self.embedding.linear_out(&normalized)?,
        };
        self.policy.cast_to_storage(&logits)
    }
}
