//! Core deterministic primitives.
//!
//! Pure functions only: hashing and entropy folding. Everything the anchored
//! proof chain commits to is derived through this module so that replay
//! verification reproduces it exactly.

pub mod folder;
pub mod hash;

// Re-export core types
pub use folder::{unit_interval, RecursiveFolder};
pub use hash::{sha256, GameId, Hash32, HashBuilder, TxId, ZERO_HASH};
