//! # Kas Runner Core
//!
//! Provable gameplay core for Kas Runner: every move is drawn from verifiable
//! entropy, committed to a Merkle log and anchored on the ledger so a third
//! party can audit the whole session afterwards.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    KAS RUNNER CORE                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                 │
//! │  ├── hash.rs     - SHA-256 helpers, domain separation       │
//! │  └── folder.rs   - Recursive entropy folding                │
//! │                                                             │
//! │  proof/          - Verifiable artefacts                     │
//! │  ├── moves.rs    - Moves and leaf preimages                 │
//! │  ├── merkle.rs   - Append-only Merkle accumulator           │
//! │  ├── anchor.rs   - Genesis / Heartbeat / Final layouts      │
//! │  └── chain.rs    - Anchor chain auditing                    │
//! │                                                             │
//! │  entropy/        - VRF pipeline (prefetch, replay)          │
//! │  ledger/         - Ledger capability trait + mock           │
//! │  anchor/         - Retry, UTXO pool, anchor processor       │
//! │  session/        - Phases, integrity, controller, events    │
//! │  config.rs       - Tunables and environment overrides       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! `core/` and `proof/` are pure: identical inputs give identical hashes,
//! roots and payloads on every platform. Entropy draws are reproducible from
//! the seed and the secondary hashes committed in Genesis.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod anchor;
pub mod config;
pub mod core;
pub mod entropy;
pub mod ledger;
pub mod proof;
pub mod session;

// Re-export commonly used types
pub use crate::core::hash::{GameId, Hash32, TxId};
pub use config::CoreConfig;
pub use ledger::{LedgerClient, LedgerError};
#[cfg(any(test, feature = "test-utils"))]
pub use ledger::MockLedger;
pub use proof::{ActionCode, Anchor, AnchorKind, Move, Outcome};
pub use session::{SessionController, SessionError, SessionEvent, SessionResults};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
