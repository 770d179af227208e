//! Positional encodings.

pub mod rope;

pub use rope::RopeTable;
