//! Token embedding table and tied readout head.

use candle_core::{bail, DType, Device, Error, Result, Tensor};
use layers::PrecisionPolicy;

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    /// Storage dtype used for parameters and outputs.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

/// Vocabulary embedding table with an optional tied projection head.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    /// Builds a table with parameters sampled from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        let shape = (config.vocab_size, config.hidden_dim);
        let weight = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        Self::from_weight(weight, config)
    }

    /// Wraps an existing `(vocab_size, hidden_dim)` table.
    pub fn from_weight(weight: Tensor, config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        layers::checks::expect_shape(
            "embedding.weight",
            &weight,
            &[config.vocab_size, config.hidden_dim],
        )?;

        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);
        let weight = if weight.dtype() == config.dtype {
            weight
        } else {
            weight.to_dtype(config.dtype)?
        };

        Ok(Self {
            config,
            weight,
            policy,
        })
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Returns a clone of the underlying table.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Ids must be shaped `(batch, seq)` with an integer dtype and lie in
    /// `[0, vocab_size)`. Outputs follow `(batch, seq, hidden)` in the
    /// configured storage dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let dims = token_ids.dims();
        match dims {
            [batch, seq] if *batch > 0 && *seq > 0 => {}
            _ => {
                return Err(Error::Msg(format!(
                    "token_ids must be shaped (batch, seq) with non-zero dims, got {dims:?}"
                )))
            }
        }
        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "token_ids expected integer dtype, got {:?}",
                token_ids.dtype()
            )));
        }

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.index_select(&flat, 0)?;
        let mut output_dims = dims.to_vec();
        output_dims.push(self.config.hidden_dim);
        gathered.reshape(output_dims)
    }

    /// Tied readout: projects hidden states through the transposed table.
    pub fn linear_out(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden_dim) = match hidden.dims() {
            [batch, seq, hidden_dim] => (*batch, *seq, *hidden_dim),
            dims => {
                return Err(Error::Msg(format!(
                    "linear_out expects (batch, seq, hidden), got {dims:?}"
                )))
            }
        };
        if hidden_dim != self.config.hidden_dim {
            return Err(Error::Msg(format!(
                "linear_out expected hidden dim {}, got {hidden_dim}",
                self.config.hidden_dim
            )));
        }

        let input = self.policy.cast_for_matmul(hidden)?;
        let weight_t = self.policy.cast_for_matmul(&self.weight)?.t()?;
        let logits = input
            .reshape((batch * seq, hidden_dim))?
            .matmul(&weight_t)?
            .reshape((batch, seq, self.config.vocab_size))?;
        self.policy.cast_to_storage(&logits)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {min_id}"
            )));
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.config.vocab_size as i64 {
            return Err(Error::Msg(format!(
                "token id {max_id} exceeds vocab size {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(device: &Device) -> TokenEmbeddingConfig {
        TokenEmbeddingConfig {
            vocab_size: 8,
            hidden_dim: 4,
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    #[test]
    fn lookup_returns_table_rows() -> Result<()> {
        let device = Device::Cpu;
        let embedding = TokenEmbedding::new(config(&device))?;
        let ids = Tensor::from_slice(&[0i64, 3, 7], (1, 3), &device)?;
        let out = embedding.forward(&ids)?;
        assert_eq!(out.dims(), &[1, 3, 4]);

        let table = embedding.weight().to_vec2::<f32>()?;
        let rows = out.reshape((3, 4))?.to_vec2::<f32>()?;
        assert_eq!(rows[0], table[0]);
        assert_eq!(rows[1], table[3]);
        assert_eq!(rows[2], table[7]);
        Ok(())
    }

    #[test]
    fn out_of_range_ids_are_fatal() -> Result<()> {
        let device = Device::Cpu;
        let embedding = TokenEmbedding::new(config(&device))?;
        let ids = Tensor::from_slice(&[0i64, 8], (1, 2), &device)?;
        assert!(embedding.forward(&ids).is_err());
        Ok(())
    }

    #[test]
    fn tied_readout_matches_manual_transpose() -> Result<()> {
        let device = Device::Cpu;
        let embedding = TokenEmbedding::new(config(&device))?;
        let hidden = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let logits = embedding.linear_out(&hidden)?;
        assert_eq!(logits.dims(), &[2, 3, 8]);

        let manual = hidden
            .reshape((6, 4))?
            .matmul(&embedding.weight().t()?)?
            .reshape((2, 3, 8))?;
        let diff = logits.sub(&manual)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn wrong_table_shape_is_rejected() {
        let device = Device::Cpu;
        let cfg = config(&device);
        let wrong = Tensor::zeros((8, 5), DType::F32, &device).unwrap();
        assert!(TokenEmbedding::from_weight(wrong, cfg).is_err());
    }
}
