//! Precomputed rotary position embedding tables.
//!
//! A [`RopeTable`] holds f32 cosine/sine matrices shaped
//! `(max_len, head_dim)` for one frequency base. The half-dim angle vector is
//! duplicated across the two halves of the head axis, matching the
//! split-halves rotation below (rather than interleaved pairs): for an input
//! split into halves `x1, x2`, the rotated companion is `concat(-x2, x1)` and
//! the output is `x * cos + rotated * sin`.
//!
//! Two independent instances normally coexist: a smaller-period "local" base
//! for sliding-window layers and a larger-period "global" base for
//! full-attention layers. Both are shared read-only across layers and calls.

use candle_core::{bail, DType, Device, Result, Tensor, D};

/// Cos/sin lookup tables for one RoPE frequency base.
#[derive(Debug, Clone)]
pub struct RopeTable {
    head_dim: usize,
    max_len: usize,
    cos: Tensor,
    sin: Tensor,
}

impl RopeTable {
    /// Precomputes tables for positions `[0, max_len)`.
    ///
    /// `inv_freq[k] = base^(-2k / head_dim)` for `k` in `[0, head_dim / 2)`;
    /// the angle at `(p, k)` is `p * inv_freq[k]`.
    pub fn new(head_dim: usize, base: f32, max_len: usize, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            bail!("rope head_dim must be even and non-zero, got {head_dim}");
        }
        if max_len == 0 {
            bail!("rope table length must be non-zero");
        }
        if base <= 0.0 {
            bail!("rope base must be positive, got {base}");
        }

        let half = head_dim / 2;
        let base = base as f64;
        let inv_freqs: Vec<f64> = (0..half)
            .map(|k| base.powf(-((2 * k) as f64) / head_dim as f64))
            .collect();

        let mut cos_data = Vec::with_capacity(max_len * head_dim);
        let mut sin_data = Vec::with_capacity(max_len * head_dim);
        for pos in 0..max_len {
            for _ in 0..2 {
                for inv_freq in &inv_freqs {
                    let angle = pos as f64 * inv_freq;
                    cos_data.push(angle.cos() as f32);
                    sin_data.push(angle.sin() as f32);
                }
            }
        }

        let cos = Tensor::from_vec(cos_data, (max_len, head_dim), device)?;
        let sin = Tensor::from_vec(sin_data, (max_len, head_dim), device)?;
        log::debug!("rope table built: base={base} len={max_len} head_dim={head_dim}");

        Ok(Self {
            head_dim,
            max_len,
            cos,
            sin,
        })
    }

    /// Per-head dimensionality the table was built for.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of positions covered by the table.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Read-only cosine table, shaped `(max_len, head_dim)`.
    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Read-only sine table, shaped `(max_len, head_dim)`.
    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Rotates `x` (shaped `(batch, heads, seq, head_dim)`) using table rows
    /// `[offset, offset + seq)`.
    ///
    /// Queries rotate at their absolute start position. Keys are cached
    /// unrotated, so the full concatenated key sequence rotates at
    /// `start_pos - previously_cached_len`, which assigns every key its
    /// absolute position again. Computation happens in f32 and the result is
    /// cast back to the input dtype.
    pub fn rotate(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_batch, _heads, seq, head_dim) = x.dims4()?;
        if head_dim != self.head_dim {
            bail!(
                "rope table built for head_dim {}, input has {head_dim}",
                self.head_dim
            );
        }
        if offset + seq > self.max_len {
            bail!(
                "rope table covers {} positions, rows [{offset}, {}) requested",
                self.max_len,
                offset + seq
            );
        }

        let dtype = x.dtype();
        let cos = self
            .cos
            .narrow(0, offset, seq)?
            .reshape((1, 1, seq, head_dim))?;
        let sin = self
            .sin
            .narrow(0, offset, seq)?
            .reshape((1, 1, seq, head_dim))?;

        let half = head_dim / 2;
        let x = x.to_dtype(DType::F32)?;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        let out = x
            .broadcast_mul(&cos)?
            .add(&rotated.broadcast_mul(&sin)?)?;
        out.to_dtype(dtype)
    }
}
