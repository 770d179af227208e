//! Named-tensor weight ingestion.
//!
//! [`Model::from_weights`] consumes a string-keyed map of tensors under a
//! fixed naming convention (`token_embd.weight`, `output_norm.weight`,
//! optional `output.weight`, and `blk.{i}.*` per layer) and assigns each to
//! its destination parameter. Every mismatch between an expected and a
//! supplied shape is fatal and names the offending key; ingestion aborts at
//! the first failure. An absent `output.weight` ties the readout to the
//! transposed embedding table.
//!
//! Norm tensors are expected in the zero-centered convention (the stored
//! value is `scale - 1`); sources using a plain multiplier must be adapted
//! before ingestion.

use std::collections::HashMap;

use candle_core::Tensor;
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    FeedForward, FeedForwardConfig, Linear, LinearConfig, NormConfig, RmsNorm,
};
use attention::GroupedQueryAttention;
use thiserror::Error;

use crate::{block::DecoderBlock, config::ModelConfig, model::Model};

/// Errors raised while assigning named tensors to parameters.
#[derive(Debug, Error)]
pub enum WeightLoadError {
    /// The configuration failed validation before any tensor was touched.
    #[error("configuration rejected: {reason}")]
    Config { reason: String },
    /// A required tensor is absent from the map.
    #[error("missing tensor `{name}`")]
    MissingTensor { name: String },
    /// A tensor is present but its shape disagrees with its destination.
    #[error("tensor `{name}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// A tensor operation failed while wiring `name` into place.
    #[error("failed to load `{name}`: {source}")]
    Tensor {
        name: String,
        source: candle_core::Error,
    },
}

/// String-keyed collection of named weight tensors.
#[derive(Debug, Default)]
pub struct WeightMap {
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    /// Wraps an existing name-to-tensor map.
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Number of tensors still unassigned.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether all tensors have been assigned.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Removes and returns a required tensor, checking its shape.
    fn take(&mut self, name: &str, expected: &[usize]) -> Result<Tensor, WeightLoadError> {
        match self.take_optional(name, expected)? {
            Some(tensor) => Ok(tensor),
            None => Err(WeightLoadError::MissingTensor {
                name: name.to_string(),
            }),
        }
    }

    /// Removes and returns an optional tensor; a present tensor with the
    /// wrong shape is still fatal.
    fn take_optional(
        &mut self,
        name: &str,
        expected: &[usize],
    ) -> Result<Option<Tensor>, WeightLoadError> {
        let Some(tensor) = self.tensors.remove(name) else {
            return Ok(None);
        };
        if tensor.dims() != expected {
            return Err(WeightLoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(Some(tensor))
    }

    fn leftover_names(&self) -> Vec<&str> {
        self.tensors.keys().map(String::as_str).collect()
    }
}

impl FromIterator<(String, Tensor)> for WeightMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

fn wire<T>(name: &str, result: candle_core::Result<T>) -> Result<T, WeightLoadError> {
    result.map_err(|source| WeightLoadError::Tensor {
        name: name.to_string(),
        source,
    })
}

impl Model {
    /// Builds the model by assigning every tensor in `weights` to its
    /// parameter under the fixed naming convention.
    pub fn from_weights(
        config: ModelConfig,
        mut weights: WeightMap,
    ) -> Result<Self, WeightLoadError> {
        config
            .validate()
            .map_err(|e| WeightLoadError::Config {
                reason: e.to_string(),
            })?;

        let hidden = config.hidden_dim;
        let q_dim = config.n_heads * config.head_dim;
        let kv_dim = config.n_kv_groups * config.head_dim;
        let inter = config.intermediate_size;

        let mut norm_cfg = NormConfig::new(hidden);
        norm_cfg.epsilon = config.norm_eps;
        let mut head_norm_cfg = NormConfig::new(config.head_dim);
        head_norm_cfg.epsilon = config.norm_eps;

        let take_norm = |weights: &mut WeightMap, name: &str, cfg: &NormConfig| {
            let tensor = weights.take(name, &[cfg.size])?;
            wire(name, RmsNorm::new(tensor, cfg.clone()))
        };
        let take_linear =
            |weights: &mut WeightMap, name: &str, in_dim: usize, out_dim: usize| {
                let tensor = weights.take(name, &[out_dim, in_dim])?;
                wire(name, Linear::new(LinearConfig::new(in_dim, out_dim), tensor, None))
            };

        let name = "token_embd.weight";
        let embedding_weight = weights.take(name, &[config.vocab_size, hidden])?;
        let embedding = wire(
            name,
            TokenEmbedding::from_weight(
                embedding_weight,
                TokenEmbeddingConfig {
                    vocab_size: config.vocab_size,
                    hidden_dim: hidden,
                    dtype: config.dtype,
                    device: config.device.clone(),
                },
            ),
        )?;

        let final_norm = take_norm(&mut weights, "output_norm.weight", &norm_cfg)?;

        let output_proj = match weights.take_optional("output.weight", &[config.vocab_size, hidden])? {
            Some(tensor) => Some(wire(
                "output.weight",
                Linear::new(LinearConfig::new(hidden, config.vocab_size), tensor, None),
            )?),
            None => {
                log::debug!("output.weight absent, tying readout to the embedding table");
                None
            }
        };

        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            let prefix = format!("blk.{layer}");

            let q_proj = take_linear(&mut weights, &format!("{prefix}.attn_q.weight"), hidden, q_dim)?;
            let k_proj = take_linear(&mut weights, &format!("{prefix}.attn_k.weight"), hidden, kv_dim)?;
            let v_proj = take_linear(&mut weights, &format!("{prefix}.attn_v.weight"), hidden, kv_dim)?;
            let out_proj =
                take_linear(&mut weights, &format!("{prefix}.attn_output.weight"), q_dim, hidden)?;

            let (q_norm, k_norm) = if config.qk_norm {
                (
                    Some(take_norm(
                        &mut weights,
                        &format!("{prefix}.attn_q_norm.weight"),
                        &head_norm_cfg,
                    )?),
                    Some(take_norm(
                        &mut weights,
                        &format!("{prefix}.attn_k_norm.weight"),
                        &head_norm_cfg,
                    )?),
                )
            } else {
                (None, None)
            };

            let attention = wire(
                &format!("{prefix}.attn_q.weight"),
                GroupedQueryAttention::from_parts(
                    config.attention_config(),
                    config.dtype,
                    q_proj,
                    k_proj,
                    v_proj,
                    out_proj,
                    q_norm,
                    k_norm,
                ),
            )?;

            let input_norm = take_norm(&mut weights, &format!("{prefix}.attn_norm.weight"), &norm_cfg)?;
            let post_attention_norm = take_norm(
                &mut weights,
                &format!("{prefix}.post_attention_norm.weight"),
                &norm_cfg,
            )?;
            let pre_ff_norm = take_norm(&mut weights, &format!("{prefix}.ffn_norm.weight"), &norm_cfg)?;
            let post_ff_norm =
                take_norm(&mut weights, &format!("{prefix}.post_ffw_norm.weight"), &norm_cfg)?;

            let gate = take_linear(&mut weights, &format!("{prefix}.ffn_gate.weight"), hidden, inter)?;
            let up = take_linear(&mut weights, &format!("{prefix}.ffn_up.weight"), hidden, inter)?;
            let down = take_linear(&mut weights, &format!("{prefix}.ffn_down.weight"), inter, hidden)?;
            let mlp = wire(
                &format!("{prefix}.ffn_gate.weight"),
                FeedForward::new(FeedForwardConfig::new(hidden, inter), gate, up, down),
            )?;

            let block = wire(
                &prefix,
                DecoderBlock::from_parts(
                    &config,
                    config.layer_types[layer],
                    input_norm,
                    attention,
                    post_attention_norm,
                    pre_ff_norm,
                    mlp,
                    post_ff_norm,
                ),
            )?;
            blocks.push(block);
        }

        if !weights.is_empty() {
            log::warn!(
                "ignoring {} unassigned tensors: {:?}",
                weights.len(),
                weights.leftover_names()
            );
        }

        wire(
            "model",
            Model::from_parts(config, embedding, blocks, final_norm, output_proj),
        )
    }
}
