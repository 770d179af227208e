//! Core types shared across the attention crate.

pub mod config;

pub use self::config::AttentionConfig;

/// Attention regime assigned to a layer, fixed at construction.
///
/// Sliding layers restrict causal attention to the most recent window of key
/// positions and keep a bounded cache; full layers attend over the whole
/// prefix and their caches grow with the generated length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Causal attention bounded to a trailing window of key positions.
    Sliding,
    /// Unbounded causal attention over the full prefix.
    Full,
}
