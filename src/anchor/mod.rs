//! Anchoring pipeline.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ANCHOR LAYER                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  retry.rs     - Bounded retry, transient errors only        │
//! │  utxo.rs      - Split output pool + funding runway          │
//! │  processor.rs - Genesis / Heartbeat batching / Final        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod processor;
pub mod retry;
pub mod utxo;

pub use processor::{AnchorError, AnchorProcessor, FinalCompletion, FinalInput, FinalReceipt};
pub use retry::{retry, Backoff, RetryError, RetryPolicy};
pub use utxo::{PoolStatus, Runway, UtxoError, UtxoPoolManager};
