//! Boolean attention mask builders.
//!
//! Masks produced here are `u8` tensors shaped `(q_len, k_len)` where nonzero
//! means the pair is forbidden. The attention kernel substitutes `-inf` for
//! forbidden scores before the softmax; masks themselves carry no score
//! values. Query row `i` corresponds to absolute position `pos_start + i` and
//! key column `j` to absolute position `pos_end - k_len + j` (the trailing
//! `k_len` key positions), so the same builders serve full passes and
//! incremental decoding. Masks are recomputed every call and never persisted.

pub mod causal;
pub mod sliding;

use candle_core::DType;

/// Dtype shared by all boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::build_causal_mask;
pub use sliding::build_sliding_mask;
