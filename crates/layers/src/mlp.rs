//! Gated position-wise feed-forward block.
//!
//! Operates on hidden states shaped `(batch, seq, hidden)` and returns the
//! same layout. Two independent bias-free projections expand the hidden
//! dimension to `intermediate_size` (gate and up branches); the activated
//! gate multiplies the up branch elementwise before a bias-free contraction
//! back to the model hidden size.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration for the gated feed-forward network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the gated activation space.
    pub intermediate_size: usize,
    /// Activation applied to the gate branch.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    /// Creates a configuration using the tanh-approximated GELU gate.
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation: ActivationKind::GeluTanh,
        }
    }
}

/// Gated two-branch MLP.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl FeedForward {
    /// Assembles the block from pre-built projections.
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        for (name, proj, in_dim, out_dim) in [
            ("feed_forward.gate", &gate, config.hidden_size, config.intermediate_size),
            ("feed_forward.up", &up, config.hidden_size, config.intermediate_size),
            ("feed_forward.down", &down, config.intermediate_size, config.hidden_size),
        ] {
            let cfg = proj.config();
            if cfg.input_dim != in_dim || cfg.output_dim != out_dim {
                return Err(Error::Msg(format!(
                    "{name} expected {in_dim} -> {out_dim}, got {} -> {}",
                    cfg.input_dim, cfg.output_dim
                )));
            }
            if cfg.bias {
                return Err(Error::Msg(format!("{name} must be bias-free")));
            }
        }
        Ok(Self {
            config,
            gate,
            up,
            down,
        })
    }

    /// Builds the block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size);
        let gate = Linear::with_init(expand.clone(), init, device, dtype)?;
        let up = Linear::with_init(expand, init, device, dtype)?;
        let down = Linear::with_init(contract, init, device, dtype)?;
        Self::new(config, gate, up, down)
    }

    /// Configuration metadata used during block assembly.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Forward pass through the gated MLP.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = self.gate.forward(hidden, policy)?;
        let gate = self.config.activation.apply(&gate, policy)?;
        let up = self.up.forward(hidden, policy)?;

        let gated = policy
            .cast_for_matmul(&gate)?
            .mul(&policy.cast_for_matmul(&up)?)?;
        let gated = policy.cast_to_storage(&gated)?;
        self.down.forward(&gated, policy)
    }
}
