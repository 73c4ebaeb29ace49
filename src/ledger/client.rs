//! Ledger Capability Set
//!
//! Everything the core needs from the external ledger client, as one
//! object-safe async trait. Optional capabilities have default bodies that
//! return [`LedgerError::Unsupported`], so a missing capability is a typed,
//! checked state rather than a silently skipped call.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::hash::{GameId, Hash32, TxId};
use crate::proof::anchor::{QrngTuple, NIST_OUTPUT_SIZE, NIST_SIGNATURE_SIZE};
use crate::proof::Outcome;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Block header as delivered by the block stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block hash.
    pub hash: Hash32,
    /// DAA score of the block.
    pub daa_score: u64,
}

/// VRF proof request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveRequest {
    /// `seed:counter` input string.
    pub seed_input: String,
    /// Secondary-source block hashes mixed into the output.
    pub secondary_hashes: Vec<Hash32>,
}

/// VRF proof response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfProof {
    /// Opaque proof bytes.
    pub proof: Vec<u8>,
    /// Whitened output.
    pub output: Hash32,
}

/// QRNG beacon providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrngSource {
    /// NIST randomness beacon.
    Nist,
}

/// Signed QRNG pulse as returned by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrngPulse {
    /// Beacon pulse index.
    pub pulse_index: u64,
    /// Output value (64 bytes).
    pub output: Vec<u8>,
    /// Signature (512 bytes).
    pub signature: Vec<u8>,
}

impl QrngPulse {
    /// Convert to the fixed-width anchor tuple.
    pub fn to_tuple(&self) -> Result<QrngTuple, LedgerError> {
        let output: [u8; NIST_OUTPUT_SIZE] = self
            .output
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Malformed(format!("qrng output is {} bytes", self.output.len())))?;
        let signature: [u8; NIST_SIGNATURE_SIZE] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| LedgerError::Malformed(format!("qrng signature is {} bytes", self.signature.len())))?;
        Ok(QrngTuple { pulse_index: self.pulse_index, output, signature })
    }
}

/// Transaction output reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    /// Funding transaction.
    pub tx_id: TxId,
    /// Output index.
    pub index: u32,
}

/// Spendable output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Output reference.
    pub outpoint: Outpoint,
    /// Amount in sompi.
    pub amount_sompi: u64,
}

/// Anchor observed from another lobby participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnchor {
    /// Submitting player.
    pub player_id: String,
    /// Session the anchor belongs to.
    pub game_id: GameId,
    /// Carrying transaction.
    pub tx_id: TxId,
    /// Encoded anchor payload.
    pub payload: Vec<u8>,
}

/// Lobby-wide notices sent through the client's lobby transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyNotice {
    /// Session aborted before it could be anchored.
    Abort {
        /// Aborted session.
        game_id: GameId,
        /// Human-readable reason.
        reason: String,
    },
    /// Local player finished.
    Ended {
        /// Finished session.
        game_id: GameId,
        /// Outcome.
        outcome: Outcome,
    },
}

// =============================================================================
// ERRORS
// =============================================================================

/// Ledger client capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// `get_random`.
    Random,
    /// `prove`.
    Prove,
    /// `get_qrng`.
    Qrng,
    /// `secondary_block_hashes`.
    SecondaryBlocks,
    /// Lobby transport.
    Lobby,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Random => "random",
            Self::Prove => "prove",
            Self::Qrng => "qrng",
            Self::SecondaryBlocks => "secondary-blocks",
            Self::Lobby => "lobby",
        };
        f.write_str(name)
    }
}

/// Ledger client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// HTTP 429 or equivalent.
    #[error("rate limited")]
    RateLimited,

    /// Server-side failure with status code.
    #[error("server error (status {0})")]
    Server(u16),

    /// Capability exists but is temporarily unreachable.
    #[error("{0} capability unavailable")]
    Unavailable(Capability),

    /// Capability not offered by this client.
    #[error("{0} capability not supported")]
    Unsupported(Capability),

    /// Signature check failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Request or response could not be parsed.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Not enough funds for the transaction.
    #[error("insufficient funds: need {needed} sompi, have {available}")]
    InsufficientFunds {
        /// Sompi required.
        needed: u64,
        /// Sompi available.
        available: u64,
    },

    /// Transaction rejected by the ledger.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::RateLimited | Self::Unavailable(_) => true,
            Self::Server(status) => *status == 429 || *status >= 500,
            Self::Unsupported(_)
            | Self::InvalidSignature
            | Self::Malformed(_)
            | Self::InsufficientFunds { .. }
            | Self::Rejected(_) => false,
        }
    }
}

// =============================================================================
// CAPABILITY TRAIT
// =============================================================================

/// External ledger client.
///
/// Dropping a receiver returned by `subscribe_*` is the unsubscribe.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Subscribe to the block header stream.
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeader>;

    /// Current virtual DAA score.
    async fn current_daa_score(&self) -> Result<u64, LedgerError>;

    /// Submit an anchor payload, returning the carrying transaction id.
    async fn submit_anchor(&self, payload: &[u8]) -> Result<TxId, LedgerError>;

    /// Wallet balance in sompi.
    async fn balance(&self) -> Result<u64, LedgerError>;

    /// Spendable outputs.
    async fn utxos(&self) -> Result<Vec<Utxo>, LedgerError>;

    /// Split funds into `count` outputs of `amount_each` sompi.
    async fn split_utxos(&self, count: usize, amount_each: u64) -> Result<TxId, LedgerError>;

    /// Ledger-derived random value for a seed.
    async fn get_random(&self, _seed: &str) -> Result<Hash32, LedgerError> {
        Err(LedgerError::Unsupported(Capability::Random))
    }

    /// VRF proof and whitened output for a seed input.
    async fn prove(&self, _request: ProveRequest) -> Result<VrfProof, LedgerError> {
        Err(LedgerError::Unsupported(Capability::Prove))
    }

    /// Signed QRNG pulse.
    async fn get_qrng(&self, _source: QrngSource, _bytes: usize) -> Result<QrngPulse, LedgerError> {
        Err(LedgerError::Unsupported(Capability::Qrng))
    }

    /// Most recent secondary-source block hashes, newest last.
    async fn secondary_block_hashes(&self, _count: usize) -> Result<Vec<Hash32>, LedgerError> {
        Err(LedgerError::Unsupported(Capability::SecondaryBlocks))
    }

    /// Telemetry event; best effort.
    async fn record_event(&self, _kind: &str, _meta: serde_json::Value) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Subscribe to anchors from other lobby participants, if supported.
    fn subscribe_peer_anchors(&self) -> Option<broadcast::Receiver<PeerAnchor>> {
        None
    }

    /// Send a notice to every lobby participant.
    async fn broadcast_lobby(&self, _lobby_id: &str, _notice: LobbyNotice) -> Result<(), LedgerError> {
        Err(LedgerError::Unsupported(Capability::Lobby))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::Network("reset".into()).is_transient());
        assert!(LedgerError::Timeout.is_transient());
        assert!(LedgerError::RateLimited.is_transient());
        assert!(LedgerError::Server(503).is_transient());
        assert!(LedgerError::Server(429).is_transient());
        assert!(LedgerError::Unavailable(Capability::Prove).is_transient());

        assert!(!LedgerError::Server(400).is_transient());
        assert!(!LedgerError::InvalidSignature.is_transient());
        assert!(!LedgerError::Malformed("bad".into()).is_transient());
        assert!(!LedgerError::Unsupported(Capability::Qrng).is_transient());
        assert!(!LedgerError::InsufficientFunds { needed: 2, available: 1 }.is_transient());
    }

    #[test]
    fn test_pulse_width_checked() {
        let pulse = QrngPulse { pulse_index: 7, output: vec![1; 64], signature: vec![2; 512] };
        let tuple = pulse.to_tuple().unwrap();
        assert_eq!(tuple.pulse_index, 7);
        assert_eq!(tuple.signature[511], 2);

        let short = QrngPulse { signature: vec![2; 100], ..pulse };
        assert!(matches!(short.to_tuple(), Err(LedgerError::Malformed(_))));
    }

    #[test]
    fn test_lobby_notice_json() {
        let notice = LobbyNotice::Abort { game_id: GameId::nil(), reason: "genesis failed".into() };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "abort");
        assert_eq!(json["reason"], "genesis failed");
    }
}
