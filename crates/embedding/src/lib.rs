//! Embedding crate.
//!
//! `token` hosts the vocabulary embedding table with its tied readout;
//! `positional` hosts the precomputed rotary position embedding tables.

pub mod positional;
pub mod token;

pub use positional::rope::RopeTable;
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
