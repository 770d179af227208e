//! Grouped-query attention primitives for the decoder stack.
//!
//! The crate covers the attention-side building blocks: the per-layer regime
//! tag and configuration (`core`), boolean mask builders (`masks`), the
//! caller-owned key/value cache value (`kv_cache`), and the grouped-query
//! attention component itself (`gqa`). Tensors follow the
//! `[batch, heads, seq, head_dim]` layout; score reductions run in `f32`
//! regardless of the storage dtype.

pub mod core;
pub mod gqa;
pub mod kv_cache;
pub mod masks;

pub use crate::core::{AttentionConfig, AttentionKind};
pub use gqa::GroupedQueryAttention;
pub use kv_cache::LayerCache;
