//! Binary Anchor Payloads
//!
//! The three on-ledger commitments of a session, as typed structs with one
//! encoder and one decoder each. Every payload starts with
//! `version(1) · anchor_type(1)`; all integers are little-endian.
//!
//! ```text
//! GENESIS (890 bytes)
//!   game_id_hash(32) seed_hash(32) secondary_hashes(6×32)
//!   start_daa(8) end_daa(8) nist_index(8) nist_output(64) nist_signature(512)
//!   initial_vrf(32)
//!
//! HEARTBEAT (70-byte header + moves + optional deltas)
//!   merkle_root(32) prev_tx_id(32) delta_flags(1) move_count(1) section_len(2)
//!   records: 8 bytes standard / 16 bytes extended
//!   [flags bit0] delta_block_hash(32)
//!   [flags bit1] nist_index(8) nist_output(64) nist_signature(512)
//!
//! FINAL (144 bytes)
//!   merkle_root(32) genesis_tx_id(32) prev_tx_id(32) result_leaf(32)
//!   score(4) coins(4) race_time_ms(4) outcome(1) total_moves(1)
//! ```
//!
//! This is a stable wire format. Any width or order change needs a new
//! version byte; decoding an unknown version fails closed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::{Hash32, TxId};
use crate::proof::moves::{ActionCode, Move};

/// Current anchor layout version.
pub const ANCHOR_VERSION: u8 = 1;

/// Number of secondary-source block hashes in Genesis.
pub const SECONDARY_SOURCE_COUNT: usize = 6;

/// Encoded Genesis size.
pub const GENESIS_SIZE: usize = 890;

/// Encoded Heartbeat header size (including version and type).
pub const HEARTBEAT_HEADER_SIZE: usize = 70;

/// Encoded Final size.
pub const FINAL_SIZE: usize = 144;

/// QRNG output hash width.
pub const NIST_OUTPUT_SIZE: usize = 64;

/// QRNG signature width.
pub const NIST_SIGNATURE_SIZE: usize = 512;

/// Encoded QRNG tuple size (index + output + signature).
pub const NIST_TUPLE_SIZE: usize = 8 + NIST_OUTPUT_SIZE + NIST_SIGNATURE_SIZE;

/// Standard move record size.
pub const STANDARD_RECORD_SIZE: usize = 8;

/// Extended move record size.
pub const EXTENDED_RECORD_SIZE: usize = 16;

/// Heartbeat delta flag: a new secondary-source block hash follows.
pub const DELTA_NEW_BLOCK: u8 = 0b01;

/// Heartbeat delta flag: a new QRNG pulse follows.
pub const DELTA_NEW_PULSE: u8 = 0b10;

// =============================================================================
// ENUMS
// =============================================================================

/// Anchor type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnchorKind {
    /// Initial contract.
    Genesis = 1,
    /// Periodic move batch.
    Heartbeat = 2,
    /// Closing verdict.
    Final = 3,
}

impl AnchorKind {
    /// Parse the type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Genesis),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Final),
            _ => None,
        }
    }
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Outcome {
    /// Race finished normally.
    Complete = 0,
    /// Opponent (or player) went silent.
    Forfeit = 1,
    /// DAA window elapsed.
    Timeout = 2,
    /// Integrity violation detected.
    Cheat = 3,
}

impl Outcome {
    /// Parse the outcome byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Complete),
            1 => Some(Self::Forfeit),
            2 => Some(Self::Timeout),
            3 => Some(Self::Cheat),
            _ => None,
        }
    }
}

/// Codec errors. Decoding never guesses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorCodecError {
    /// Version byte not understood.
    #[error("unsupported anchor version {0}")]
    UnsupportedVersion(u8),

    /// Type byte not understood.
    #[error("unknown anchor type {0}")]
    UnknownAnchorType(u8),

    /// Payload ended early.
    #[error("payload truncated: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset of the failed read.
        offset: usize,
        /// Bytes requested.
        needed: usize,
        /// Bytes left.
        available: usize,
    },

    /// Bytes left after the last field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Outcome byte not understood.
    #[error("invalid outcome code {0}")]
    InvalidOutcome(u8),

    /// Action byte not understood.
    #[error("invalid action code {0:#04x}")]
    InvalidAction(u8),

    /// Reserved heartbeat flag bits were set.
    #[error("unknown heartbeat delta flags {0:#04x}")]
    UnknownFlags(u8),

    /// Move section disagrees with its header.
    #[error("move section invalid: {0}")]
    MoveSection(String),

    /// More moves than fit the count byte.
    #[error("too many moves for one heartbeat: {0}")]
    TooManyMoves(usize),
}

// =============================================================================
// FIELD GROUPS
// =============================================================================

/// Signed QRNG beacon tuple as written into anchors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrngTuple {
    /// Beacon pulse index.
    pub pulse_index: u64,
    /// Beacon output value.
    pub output: [u8; NIST_OUTPUT_SIZE],
    /// Beacon signature over the pulse.
    pub signature: [u8; NIST_SIGNATURE_SIZE],
}

impl QrngTuple {
    /// All-zero tuple, used when no pulse has been captured.
    pub fn empty() -> Self {
        Self {
            pulse_index: 0,
            output: [0; NIST_OUTPUT_SIZE],
            signature: [0; NIST_SIGNATURE_SIZE],
        }
    }

    fn write(&self, w: &mut Writer) {
        w.put_u64(self.pulse_index);
        w.put_bytes(&self.output);
        w.put_bytes(&self.signature);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, AnchorCodecError> {
        Ok(Self {
            pulse_index: r.u64()?,
            output: r.array()?,
            signature: r.array()?,
        })
    }
}

/// One packed move inside a heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveRecord {
    /// 8 bytes: action · lane · delta_ms(u16) · vrf_tag(4).
    Standard {
        /// Action (high bit clear).
        action: ActionCode,
        /// Lane.
        lane: u8,
        /// Milliseconds since the previous move, saturating.
        delta_ms: u16,
        /// First four bytes of the VRF output.
        vrf_tag: [u8; 4],
    },
    /// 16 bytes: action · lane · delta_ms(u16) · timestamp_ms(u64) · vrf_tag(4).
    Extended {
        /// Action (high bit set).
        action: ActionCode,
        /// Lane.
        lane: u8,
        /// Milliseconds since the previous move, saturating.
        delta_ms: u16,
        /// Absolute session timestamp.
        timestamp_ms: u64,
        /// First four bytes of the VRF output.
        vrf_tag: [u8; 4],
    },
}

impl MoveRecord {
    /// Pack a move; `prev_timestamp_ms` is the previous move's timestamp.
    pub fn from_move(mv: &Move, prev_timestamp_ms: u64) -> Self {
        let delta_ms = u16::try_from(mv.timestamp_ms.saturating_sub(prev_timestamp_ms)).unwrap_or(u16::MAX);
        let vrf_tag = [mv.vrf_output[0], mv.vrf_output[1], mv.vrf_output[2], mv.vrf_output[3]];
        if mv.action.is_extended() {
            Self::Extended {
                action: mv.action,
                lane: mv.lane,
                delta_ms,
                timestamp_ms: mv.timestamp_ms,
                vrf_tag,
            }
        } else {
            Self::Standard {
                action: mv.action,
                lane: mv.lane,
                delta_ms,
                vrf_tag,
            }
        }
    }

    /// Action of this record.
    pub fn action(&self) -> ActionCode {
        match self {
            Self::Standard { action, .. } | Self::Extended { action, .. } => *action,
        }
    }

    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Standard { .. } => STANDARD_RECORD_SIZE,
            Self::Extended { .. } => EXTENDED_RECORD_SIZE,
        }
    }

    fn write(&self, w: &mut Writer) -> Result<(), AnchorCodecError> {
        match self {
            Self::Standard { action, lane, delta_ms, vrf_tag } => {
                if action.is_extended() {
                    return Err(AnchorCodecError::MoveSection(format!(
                        "extended action {:#04x} in standard record",
                        action.as_u8()
                    )));
                }
                w.put_u8(action.as_u8());
                w.put_u8(*lane);
                w.put_u16(*delta_ms);
                w.put_bytes(vrf_tag);
            }
            Self::Extended { action, lane, delta_ms, timestamp_ms, vrf_tag } => {
                if !action.is_extended() {
                    return Err(AnchorCodecError::MoveSection(format!(
                        "standard action {:#04x} in extended record",
                        action.as_u8()
                    )));
                }
                w.put_u8(action.as_u8());
                w.put_u8(*lane);
                w.put_u16(*delta_ms);
                w.put_u64(*timestamp_ms);
                w.put_bytes(vrf_tag);
            }
        }
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, AnchorCodecError> {
        let raw = r.u8()?;
        let action = ActionCode::from_u8(raw).ok_or(AnchorCodecError::InvalidAction(raw))?;
        let lane = r.u8()?;
        let delta_ms = r.u16()?;
        if action.is_extended() {
            let timestamp_ms = r.u64()?;
            Ok(Self::Extended { action, lane, delta_ms, timestamp_ms, vrf_tag: r.array()? })
        } else {
            Ok(Self::Standard { action, lane, delta_ms, vrf_tag: r.array()? })
        }
    }
}

// =============================================================================
// ANCHOR STRUCTS
// =============================================================================

/// Initial contract of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisAnchor {
    /// SHA-256 of the game id.
    pub game_id_hash: Hash32,
    /// SHA-256 of the VRF seed.
    pub seed_hash: Hash32,
    /// Secondary-source (e.g. Bitcoin) block hashes mixed into the seed.
    pub secondary_hashes: [Hash32; SECONDARY_SOURCE_COUNT],
    /// DAA score at race start.
    pub start_daa: u64,
    /// DAA score at which the race window closes.
    pub end_daa: u64,
    /// QRNG pulse captured at start.
    pub nist: QrngTuple,
    /// First VRF output of the session.
    pub initial_vrf: Hash32,
}

impl GenesisAnchor {
    /// Encode to exactly [`GENESIS_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_header(AnchorKind::Genesis, GENESIS_SIZE);
        w.put_bytes(&self.game_id_hash);
        w.put_bytes(&self.seed_hash);
        for hash in &self.secondary_hashes {
            w.put_bytes(hash);
        }
        w.put_u64(self.start_daa);
        w.put_u64(self.end_daa);
        self.nist.write(&mut w);
        w.put_bytes(&self.initial_vrf);
        w.finish()
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, AnchorCodecError> {
        let game_id_hash = r.array()?;
        let seed_hash = r.array()?;
        let mut secondary_hashes = [[0u8; 32]; SECONDARY_SOURCE_COUNT];
        for slot in &mut secondary_hashes {
            *slot = r.array()?;
        }
        Ok(Self {
            game_id_hash,
            seed_hash,
            secondary_hashes,
            start_daa: r.u64()?,
            end_daa: r.u64()?,
            nist: QrngTuple::read(r)?,
            initial_vrf: r.array()?,
        })
    }
}

/// Periodic evidence batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatAnchor {
    /// Merkle root over every leaf committed so far.
    pub merkle_root: Hash32,
    /// Previous anchor transaction in the chain.
    pub prev_tx_id: TxId,
    /// Packed moves in this batch (may be empty for a keepalive).
    pub moves: Vec<MoveRecord>,
    /// New secondary-source block hash, if one arrived since the last anchor.
    pub delta_block: Option<Hash32>,
    /// New QRNG pulse, if one was captured since the last anchor.
    pub delta_nist: Option<QrngTuple>,
}

impl HeartbeatAnchor {
    /// Delta flag byte for this heartbeat.
    pub fn delta_flags(&self) -> u8 {
        let mut flags = 0;
        if self.delta_block.is_some() {
            flags |= DELTA_NEW_BLOCK;
        }
        if self.delta_nist.is_some() {
            flags |= DELTA_NEW_PULSE;
        }
        flags
    }

    /// Encode; fails when the batch does not fit its count or length fields.
    pub fn encode(&self) -> Result<Vec<u8>, AnchorCodecError> {
        let count = u8::try_from(self.moves.len())
            .map_err(|_| AnchorCodecError::TooManyMoves(self.moves.len()))?;
        let section_len: usize = self.moves.iter().map(MoveRecord::encoded_len).sum();
        let section_len_u16 = u16::try_from(section_len)
            .map_err(|_| AnchorCodecError::TooManyMoves(self.moves.len()))?;

        let mut capacity = HEARTBEAT_HEADER_SIZE + section_len;
        if self.delta_block.is_some() {
            capacity += 32;
        }
        if self.delta_nist.is_some() {
            capacity += NIST_TUPLE_SIZE;
        }

        let mut w = Writer::with_header(AnchorKind::Heartbeat, capacity);
        w.put_bytes(&self.merkle_root);
        w.put_bytes(&self.prev_tx_id);
        w.put_u8(self.delta_flags());
        w.put_u8(count);
        w.put_u16(section_len_u16);
        for record in &self.moves {
            record.write(&mut w)?;
        }
        if let Some(block) = &self.delta_block {
            w.put_bytes(block);
        }
        if let Some(nist) = &self.delta_nist {
            nist.write(&mut w);
        }
        Ok(w.finish())
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, AnchorCodecError> {
        let merkle_root = r.array()?;
        let prev_tx_id = r.array()?;
        let flags = r.u8()?;
        if flags & !(DELTA_NEW_BLOCK | DELTA_NEW_PULSE) != 0 {
            return Err(AnchorCodecError::UnknownFlags(flags));
        }
        let count = usize::from(r.u8()?);
        let section_len = usize::from(r.u16()?);

        let mut section = Reader::new(r.take(section_len)?);
        let mut moves = Vec::with_capacity(count);
        for _ in 0..count {
            moves.push(MoveRecord::read(&mut section).map_err(|e| match e {
                AnchorCodecError::Truncated { .. } => {
                    AnchorCodecError::MoveSection(format!("{count} records overrun {section_len} bytes"))
                }
                other => other,
            })?);
        }
        if section.remaining() != 0 {
            return Err(AnchorCodecError::MoveSection(format!(
                "{} unused bytes after {count} records",
                section.remaining()
            )));
        }

        let delta_block = if flags & DELTA_NEW_BLOCK != 0 { Some(r.array()?) } else { None };
        let delta_nist = if flags & DELTA_NEW_PULSE != 0 { Some(QrngTuple::read(r)?) } else { None };

        Ok(Self { merkle_root, prev_tx_id, moves, delta_block, delta_nist })
    }
}

/// Closing verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalAnchor {
    /// Final Merkle root.
    pub merkle_root: Hash32,
    /// Genesis transaction of this chain.
    pub genesis_tx_id: TxId,
    /// Previous anchor transaction.
    pub prev_tx_id: TxId,
    /// Hash of the result record.
    pub result_leaf: Hash32,
    /// Final score.
    pub score: u32,
    /// Coins collected.
    pub coins: u32,
    /// Race time.
    pub race_time_ms: u32,
    /// How the session ended.
    pub outcome: Outcome,
    /// Total moves committed (saturating at 255).
    pub total_moves: u8,
}

impl FinalAnchor {
    /// Encode to exactly [`FINAL_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_header(AnchorKind::Final, FINAL_SIZE);
        w.put_bytes(&self.merkle_root);
        w.put_bytes(&self.genesis_tx_id);
        w.put_bytes(&self.prev_tx_id);
        w.put_bytes(&self.result_leaf);
        w.put_u32(self.score);
        w.put_u32(self.coins);
        w.put_u32(self.race_time_ms);
        w.put_u8(self.outcome as u8);
        w.put_u8(self.total_moves);
        w.finish()
    }

    fn read_body(r: &mut Reader<'_>) -> Result<Self, AnchorCodecError> {
        let merkle_root = r.array()?;
        let genesis_tx_id = r.array()?;
        let prev_tx_id = r.array()?;
        let result_leaf = r.array()?;
        let score = r.u32()?;
        let coins = r.u32()?;
        let race_time_ms = r.u32()?;
        let raw_outcome = r.u8()?;
        let outcome = Outcome::from_u8(raw_outcome).ok_or(AnchorCodecError::InvalidOutcome(raw_outcome))?;
        Ok(Self {
            merkle_root,
            genesis_tx_id,
            prev_tx_id,
            result_leaf,
            score,
            coins,
            race_time_ms,
            outcome,
            total_moves: r.u8()?,
        })
    }
}

/// Any anchor payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Anchor {
    /// Genesis payload.
    Genesis(GenesisAnchor),
    /// Heartbeat payload.
    Heartbeat(HeartbeatAnchor),
    /// Final payload.
    Final(FinalAnchor),
}

impl Anchor {
    /// Anchor type.
    pub fn kind(&self) -> AnchorKind {
        match self {
            Self::Genesis(_) => AnchorKind::Genesis,
            Self::Heartbeat(_) => AnchorKind::Heartbeat,
            Self::Final(_) => AnchorKind::Final,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, AnchorCodecError> {
        match self {
            Self::Genesis(g) => Ok(g.encode()),
            Self::Heartbeat(h) => h.encode(),
            Self::Final(f) => Ok(f.encode()),
        }
    }

    /// Decode wire bytes. Unknown versions fail before any field is read.
    pub fn decode(bytes: &[u8]) -> Result<Self, AnchorCodecError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != ANCHOR_VERSION {
            return Err(AnchorCodecError::UnsupportedVersion(version));
        }
        let raw_kind = r.u8()?;
        let kind = AnchorKind::from_u8(raw_kind).ok_or(AnchorCodecError::UnknownAnchorType(raw_kind))?;

        let anchor = match kind {
            AnchorKind::Genesis => Self::Genesis(GenesisAnchor::read_body(&mut r)?),
            AnchorKind::Heartbeat => Self::Heartbeat(HeartbeatAnchor::read_body(&mut r)?),
            AnchorKind::Final => Self::Final(FinalAnchor::read_body(&mut r)?),
        };

        match r.remaining() {
            0 => Ok(anchor),
            extra => Err(AnchorCodecError::TrailingBytes(extra)),
        }
    }

    /// Previous tx referenced by this anchor (Genesis has none).
    pub fn prev_tx_id(&self) -> Option<&TxId> {
        match self {
            Self::Genesis(_) => None,
            Self::Heartbeat(h) => Some(&h.prev_tx_id),
            Self::Final(f) => Some(&f.prev_tx_id),
        }
    }
}

// =============================================================================
// BYTE CURSORS
// =============================================================================

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_header(kind: AnchorKind, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.push(ANCHOR_VERSION);
        buf.push(kind as u8);
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], AnchorCodecError> {
        if self.remaining() < n {
            return Err(AnchorCodecError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], AnchorCodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, AnchorCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AnchorCodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, AnchorCodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, AnchorCodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proof::moves::tests::sample_move;

    pub(crate) fn sample_nist(index: u64) -> QrngTuple {
        let mut output = [0u8; NIST_OUTPUT_SIZE];
        output.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let mut signature = [0u8; NIST_SIGNATURE_SIZE];
        signature.iter_mut().enumerate().for_each(|(i, b)| *b = (i % 251) as u8);
        QrngTuple { pulse_index: index, output, signature }
    }

    pub(crate) fn sample_genesis() -> GenesisAnchor {
        let mut secondary_hashes = [[0u8; 32]; SECONDARY_SOURCE_COUNT];
        for (i, h) in secondary_hashes.iter_mut().enumerate() {
            *h = [0x10 + i as u8; 32];
        }
        GenesisAnchor {
            game_id_hash: [1; 32],
            seed_hash: [2; 32],
            secondary_hashes,
            start_daa: 1_000,
            end_daa: 2_800,
            nist: sample_nist(1_234_567),
            initial_vrf: [3; 32],
        }
    }

    fn sample_heartbeat() -> HeartbeatAnchor {
        let moves = [sample_move(0), sample_move(1)];
        let mut extended = sample_move(2);
        extended.action = ActionCode::Coin;
        HeartbeatAnchor {
            merkle_root: [4; 32],
            prev_tx_id: [5; 32],
            moves: vec![
                MoveRecord::from_move(&moves[0], 0),
                MoveRecord::from_move(&moves[1], moves[0].timestamp_ms),
                MoveRecord::from_move(&extended, moves[1].timestamp_ms),
            ],
            delta_block: Some([6; 32]),
            delta_nist: Some(sample_nist(99)),
        }
    }

    fn sample_final() -> FinalAnchor {
        FinalAnchor {
            merkle_root: [7; 32],
            genesis_tx_id: [8; 32],
            prev_tx_id: [9; 32],
            result_leaf: [10; 32],
            score: 48_210,
            coins: 312,
            race_time_ms: 179_950,
            outcome: Outcome::Complete,
            total_moves: 187,
        }
    }

    #[test]
    fn test_genesis_round_trip() {
        let genesis = sample_genesis();
        let bytes = genesis.encode();
        assert_eq!(bytes.len(), GENESIS_SIZE);
        assert_eq!(bytes[0], ANCHOR_VERSION);
        assert_eq!(bytes[1], AnchorKind::Genesis as u8);
        assert_eq!(Anchor::decode(&bytes).unwrap(), Anchor::Genesis(genesis));
    }

    #[test]
    fn test_heartbeat_round_trip_with_deltas() {
        let hb = sample_heartbeat();
        let bytes = hb.encode().unwrap();
        assert_eq!(bytes.len(), HEARTBEAT_HEADER_SIZE + 8 + 8 + 16 + 32 + NIST_TUPLE_SIZE);
        assert_eq!(bytes[66], DELTA_NEW_BLOCK | DELTA_NEW_PULSE);
        assert_eq!(bytes[67], 3);
        assert_eq!(u16::from_le_bytes([bytes[68], bytes[69]]), 32);
        assert_eq!(Anchor::decode(&bytes).unwrap(), Anchor::Heartbeat(hb));
    }

    #[test]
    fn test_empty_heartbeat_is_header_only() {
        let hb = HeartbeatAnchor {
            merkle_root: [1; 32],
            prev_tx_id: [2; 32],
            moves: Vec::new(),
            delta_block: None,
            delta_nist: None,
        };
        let bytes = hb.encode().unwrap();
        assert_eq!(bytes.len(), HEARTBEAT_HEADER_SIZE);
        assert_eq!(Anchor::decode(&bytes).unwrap(), Anchor::Heartbeat(hb));
    }

    #[test]
    fn test_final_round_trip_all_outcomes() {
        for outcome in [Outcome::Complete, Outcome::Forfeit, Outcome::Timeout, Outcome::Cheat] {
            let fin = FinalAnchor { outcome, ..sample_final() };
            let bytes = fin.encode();
            assert_eq!(bytes.len(), FINAL_SIZE);
            assert_eq!(bytes[142], outcome as u8);
            assert_eq!(Anchor::decode(&bytes).unwrap(), Anchor::Final(fin));
        }
    }

    #[test]
    fn test_unsupported_version_fails_closed() {
        let mut bytes = sample_final().encode();
        bytes[0] = 2;
        assert_eq!(Anchor::decode(&bytes), Err(AnchorCodecError::UnsupportedVersion(2)));
        // Even a lone version byte is rejected on version, not length
        assert_eq!(Anchor::decode(&[0x7F]), Err(AnchorCodecError::UnsupportedVersion(0x7F)));
    }

    #[test]
    fn test_unknown_type_and_outcome() {
        let mut bytes = sample_final().encode();
        bytes[1] = 9;
        assert_eq!(Anchor::decode(&bytes), Err(AnchorCodecError::UnknownAnchorType(9)));

        let mut bytes = sample_final().encode();
        bytes[142] = 4;
        assert_eq!(Anchor::decode(&bytes), Err(AnchorCodecError::InvalidOutcome(4)));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = sample_genesis().encode();
        assert!(matches!(
            Anchor::decode(&bytes[..GENESIS_SIZE - 1]),
            Err(AnchorCodecError::Truncated { .. })
        ));
        let mut long = bytes.clone();
        long.push(0);
        assert_eq!(Anchor::decode(&long), Err(AnchorCodecError::TrailingBytes(1)));
        assert!(matches!(Anchor::decode(&[]), Err(AnchorCodecError::Truncated { .. })));
    }

    #[test]
    fn test_heartbeat_section_mismatch() {
        let mut bytes = sample_heartbeat().encode().unwrap();
        // Claim one more record than the section holds
        bytes[67] = 4;
        assert!(matches!(Anchor::decode(&bytes), Err(AnchorCodecError::MoveSection(_))));

        let mut bytes = sample_heartbeat().encode().unwrap();
        bytes[66] |= 0b100;
        assert!(matches!(Anchor::decode(&bytes), Err(AnchorCodecError::UnknownFlags(_))));
    }

    #[test]
    fn test_record_kind_must_match_action() {
        let hb = HeartbeatAnchor {
            merkle_root: [0; 32],
            prev_tx_id: [0; 32],
            moves: vec![MoveRecord::Standard {
                action: ActionCode::PowerUp,
                lane: 0,
                delta_ms: 0,
                vrf_tag: [0; 4],
            }],
            delta_block: None,
            delta_nist: None,
        };
        assert!(matches!(hb.encode(), Err(AnchorCodecError::MoveSection(_))));
    }

    #[test]
    fn test_record_delta_saturates() {
        let mut mv = sample_move(1);
        mv.timestamp_ms = 200_000;
        match MoveRecord::from_move(&mv, 0) {
            MoveRecord::Standard { delta_ms, vrf_tag, .. } => {
                assert_eq!(delta_ms, u16::MAX);
                assert_eq!(vrf_tag, [1; 4]);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
}
