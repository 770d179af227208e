//! Building blocks shared by the decoder stack.
//!
//! Everything here follows the `(batch, seq, hidden)` activation convention
//! and the mixed-precision rules in [`dtypes::PrecisionPolicy`]: parameters
//! live in a storage dtype, matmuls and reductions promote to `f32`, public
//! outputs are cast back to storage.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{NormConfig, RmsNorm};
