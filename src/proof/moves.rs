//! Committed Moves
//!
//! A `Move` is one player action as it enters the Merkle move log. Moves are
//! immutable once appended; their leaf hash is SHA-256 over a fixed 78-byte
//! preimage.
//!
//! ```text
//! ┌──────────┬────────┬──────┬─────────────┬────────────┬────────────┐
//! │ sequence │ action │ lane │ timestamp   │ vrf_output │ block_hash │
//! │ u32 LE   │ u8     │ u8   │ u64 LE (ms) │ 32 bytes   │ 32 bytes   │
//! └──────────┴────────┴──────┴─────────────┴────────────┴────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::core::hash::{sha256, Hash32};

/// Size of the leaf preimage in bytes (4 + 1 + 1 + 8 + 32 + 32).
pub const LEAF_PREIMAGE_SIZE: usize = 78;

/// Actions a runner can take.
///
/// Codes with the high bit set are extended actions; their heartbeat records
/// carry an absolute timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActionCode {
    /// Keepalive / no-op.
    Nop = 0x00,
    /// Move one lane left.
    Left = 0x01,
    /// Move one lane right.
    Right = 0x02,
    /// Jump.
    Jump = 0x03,
    /// Slide under an obstacle.
    Slide = 0x04,
    /// Power-up picked up.
    PowerUp = 0x80,
    /// Coin collected.
    Coin = 0x81,
    /// Obstacle collision.
    Collision = 0x82,
}

impl ActionCode {
    /// Bit marking extended action codes.
    pub const EXTENDED_BIT: u8 = 0x80;

    /// Parse a raw action byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::Left),
            0x02 => Some(Self::Right),
            0x03 => Some(Self::Jump),
            0x04 => Some(Self::Slide),
            0x80 => Some(Self::PowerUp),
            0x81 => Some(Self::Coin),
            0x82 => Some(Self::Collision),
            _ => None,
        }
    }

    /// Raw wire byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this action is packed as an extended record.
    #[inline]
    pub fn is_extended(self) -> bool {
        self.as_u8() & Self::EXTENDED_BIT != 0
    }
}

/// One committed move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Per-session sequence number, strictly increasing.
    pub sequence: u32,
    /// Action taken.
    pub action: ActionCode,
    /// Lane index after the action.
    pub lane: u8,
    /// Milliseconds since the session clock started.
    pub timestamp_ms: u64,
    /// Whitened VRF output consumed by this move.
    pub vrf_output: Hash32,
    /// Hash of the latest ledger block observed when the move was made.
    pub block_hash: Hash32,
}

impl Move {
    /// Fixed 78-byte leaf preimage.
    pub fn preimage(&self) -> [u8; LEAF_PREIMAGE_SIZE] {
        let mut out = [0u8; LEAF_PREIMAGE_SIZE];
        out[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        out[4] = self.action.as_u8();
        out[5] = self.lane;
        out[6..14].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[14..46].copy_from_slice(&self.vrf_output);
        out[46..78].copy_from_slice(&self.block_hash);
        out
    }

    /// Merkle leaf hash: `sha256(preimage)`.
    pub fn leaf_hash(&self) -> Hash32 {
        sha256(&self.preimage())
    }
}
