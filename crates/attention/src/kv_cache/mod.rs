//! Caller-owned key/value history for incremental decoding.
//!
//! A [`LayerCache`] is a plain value: un-rotated keys and raw values shaped
//! `(batch, kv_heads, cached_len, head_dim)`. The cache is owned by the
//! caller across calls and threaded into and out of the attention layer; the
//! layer never holds hidden cache state. Updates go through the pure
//! [`LayerCache::append`] and sliding layers bound their memory with
//! [`LayerCache::trim_to_recent`].
//!
//! Keys are stored before rotary encoding: every call re-rotates the whole
//! concatenated key sequence at the offset of its first entry, which keeps
//! cached keys position-correct even after the oldest entries are dropped.

use candle_core::{bail, Result, Tensor};

/// Key/value history for one layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    keys: Tensor,
    values: Tensor,
}

impl LayerCache {
    /// Wraps existing key/value tensors after validating their layout.
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self> {
        let k_dims = keys.dims4()?;
        let v_dims = values.dims4()?;
        if k_dims != v_dims {
            bail!(
                "cache keys {:?} and values {:?} must share a shape",
                keys.dims(),
                values.dims()
            );
        }
        Ok(Self { keys, values })
    }

    /// Un-rotated cached keys.
    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    /// Cached values.
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.keys.dims()[2]
    }

    /// Pure cache update: concatenates new un-rotated keys and raw values
    /// onto `prev`.
    ///
    /// The returned cache always has length `previous + new`; bounding a
    /// sliding layer's cache is the caller's follow-up via
    /// [`trim_to_recent`](Self::trim_to_recent).
    pub fn append(prev: Option<&LayerCache>, keys: &Tensor, values: &Tensor) -> Result<LayerCache> {
        let Some(prev) = prev else {
            return LayerCache::new(keys.clone(), values.clone());
        };

        let (pb, ph, _, pd) = prev.keys.dims4()?;
        let (nb, nh, _, nd) = keys.dims4()?;
        if (pb, ph, pd) != (nb, nh, nd) {
            bail!(
                "cache append mismatch: cached {:?} vs new {:?}",
                prev.keys.dims(),
                keys.dims()
            );
        }

        LayerCache::new(
            Tensor::cat(&[&prev.keys, keys], 2)?,
            Tensor::cat(&[&prev.values, values], 2)?,
        )
    }

    /// Keeps the most recent `window` positions, dropping the oldest.
    pub fn trim_to_recent(&self, window: usize) -> Result<LayerCache> {
        if window == 0 {
            bail!("cannot trim a cache to zero positions");
        }
        let len = self.seq_len();
        if len <= window {
            return Ok(self.clone());
        }
        LayerCache::new(
            self.keys.narrow(2, len - window, window)?.contiguous()?,
            self.values.narrow(2, len - window, window)?.contiguous()?,
        )
    }
}
