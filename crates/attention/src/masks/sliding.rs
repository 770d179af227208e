//! Builder for sliding-window causal masks.

use candle_core::{bail, Device, Result, Tensor};

use super::causal::validate_geometry;

/// Builds a sliding-window mask for query rows `[pos_start, pos_end)` against
/// the trailing `k_len` key positions of `[0, pos_end)`.
///
/// The result is the causal mask unioned with "forbid when the query position
/// is at least `window` ahead of the key position". With `window >= 1` the
/// diagonal `(p, p)` stays permitted, so no softmax row can be fully masked.
pub fn build_sliding_mask(
    device: &Device,
    pos_start: usize,
    pos_end: usize,
    k_len: usize,
    window: usize,
) -> Result<Tensor> {
    if window == 0 {
        bail!("sliding window must be at least 1");
    }
    let q_len = validate_geometry(pos_start, pos_end, k_len)?;
    let k_base = pos_end - k_len;

    let mut data = vec![0u8; q_len * k_len];
    for i in 0..q_len {
        let q_pos = pos_start + i;
        for j in 0..k_len {
            let k_pos = k_base + j;
            if k_pos > q_pos || q_pos >= k_pos + window {
                data[i * k_len + j] = 1;
            }
        }
    }

    Tensor::from_vec(data, (q_len, k_len), device)
}
