//! Move Log and Anchor Proofs
//!
//! Everything a third party needs to check a session after the fact:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROOF LAYER                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  moves.rs   - Move + fixed 78-byte leaf preimage            │
//! │  merkle.rs  - Append-only Merkle accumulator + proofs       │
//! │  anchor.rs  - Genesis / Heartbeat / Final binary layouts    │
//! │  chain.rs   - prevTxId chain + prefix-root auditing         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod anchor;
pub mod chain;
pub mod merkle;
pub mod moves;

// Re-export key types
pub use anchor::{
    Anchor, AnchorCodecError, AnchorKind, FinalAnchor, GenesisAnchor, HeartbeatAnchor, MoveRecord, Outcome,
    QrngTuple,
};
pub use chain::{verify_chain, verify_prefix_roots, AnchorRecord, ChainError, ChainSummary};
pub use merkle::{MerkleAccumulator, MerkleError, MerkleProof};
pub use moves::{ActionCode, Move};
