//! Ledger client boundary.
//!
//! The core never talks to a node directly. It consumes the [`LedgerClient`]
//! capability set. The in-memory `MockLedger` used by the tests and the demo
//! binary is built with the `test-utils` feature.

pub mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{
    BlockHeader, Capability, LedgerClient, LedgerError, LobbyNotice, Outpoint, PeerAnchor, ProveRequest, QrngPulse,
    QrngSource, Utxo, VrfProof,
};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockLedger;
