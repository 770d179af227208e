//! Builder for plain causal masks.

use candle_core::{bail, Device, Result, Tensor};

/// Builds a causal mask for query rows `[pos_start, pos_end)` against the
/// trailing `k_len` key positions of `[0, pos_end)`.
///
/// A pair is forbidden exactly when the key position is later than the query
/// position; the diagonal `(p, p)` is always permitted.
pub fn build_causal_mask(
    device: &Device,
    pos_start: usize,
    pos_end: usize,
    k_len: usize,
) -> Result<Tensor> {
    let q_len = validate_geometry(pos_start, pos_end, k_len)?;
    let k_base = pos_end - k_len;

    let mut data = vec![0u8; q_len * k_len];
    for i in 0..q_len {
        let q_pos = pos_start + i;
        for j in 0..k_len {
            let k_pos = k_base + j;
            if k_pos > q_pos {
                data[i * k_len + j] = 1;
            }
        }
    }

    Tensor::from_vec(data, (q_len, k_len), device)
}

pub(crate) fn validate_geometry(
    pos_start: usize,
    pos_end: usize,
    k_len: usize,
) -> Result<usize> {
    if pos_end <= pos_start {
        bail!("mask rows [{pos_start}, {pos_end}) are empty");
    }
    let q_len = pos_end - pos_start;
    if k_len < q_len {
        bail!("mask needs at least {q_len} key columns, got {k_len}");
    }
    if k_len > pos_end {
        bail!("mask covers {k_len} key columns but only {pos_end} positions exist");
    }
    Ok(q_len)
}
