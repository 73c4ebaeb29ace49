//! Verifiable entropy.
//!
//! Raw pulses from the ledger, a secondary chain and the NIST beacon, and the
//! prefetching VRF source the game loop draws from.

pub mod pulse;
pub mod source;

pub use pulse::{EntropyPulse, EntropySourceKind};
pub use source::{seed_input, EntropyDraw, EntropyError, EntropySource};
