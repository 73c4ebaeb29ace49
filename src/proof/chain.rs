//! Anchor Chain Auditing
//!
//! Verifies a session's anchors the way a third party would:
//! 1. The chain starts with exactly one Genesis
//! 2. Every later anchor references the anchor submitted right before it
//! 3. A Final, if present, is last and closes on the same Genesis
//! 4. Each heartbeat root equals the root re-derived over the committed
//!    leaf prefix it covers

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::{Hash32, TxId};
use crate::proof::anchor::{Anchor, AnchorCodecError, AnchorKind, MoveRecord, Outcome};
use crate::proof::merkle::root_of;
use crate::proof::moves::Move;

/// A submitted anchor as recorded by the submitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Anchor type.
    pub kind: AnchorKind,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Ledger transaction carrying the payload.
    pub tx_id: TxId,
    /// Previous anchor transaction (None for Genesis).
    pub prev_tx_id: Option<TxId>,
}

/// Result of a successful chain check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSummary {
    /// Genesis transaction.
    pub genesis_tx_id: TxId,
    /// Last transaction in the chain.
    pub head_tx_id: TxId,
    /// Heartbeats in the chain.
    pub heartbeats: usize,
    /// Moves carried by all heartbeats.
    pub total_moves: usize,
    /// Outcome, when the chain is closed by a Final.
    pub outcome: Option<Outcome>,
}

/// Chain audit failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Nothing to verify.
    #[error("empty anchor chain")]
    Empty,

    /// A payload did not decode.
    #[error("anchor {index} failed to decode: {source}")]
    Codec {
        /// Position in the chain.
        index: usize,
        /// Decoder error.
        source: AnchorCodecError,
    },

    /// Record type disagrees with payload type.
    #[error("anchor {index} recorded as {recorded:?} but payload is {decoded:?}")]
    KindMismatch {
        /// Position in the chain.
        index: usize,
        /// Type on the record.
        recorded: AnchorKind,
        /// Type in the payload.
        decoded: AnchorKind,
    },

    /// First anchor is not a Genesis, or a second Genesis appeared.
    #[error("chain must start with exactly one genesis (offending index {0})")]
    Genesis(usize),

    /// A Final is followed by more anchors.
    #[error("final anchor at {0} is not the last anchor")]
    FinalNotLast(usize),

    /// A tx id appears twice.
    #[error("duplicate transaction {0}")]
    DuplicateTx(String),

    /// prev link does not point at the preceding anchor.
    #[error("anchor {index} does not reference its predecessor")]
    BrokenLink {
        /// Position in the chain.
        index: usize,
    },

    /// Final closes on a different Genesis.
    #[error("final anchor references a different genesis")]
    GenesisMismatch,

    /// Heartbeats cover more moves than were supplied.
    #[error("heartbeat {index} covers {covered} moves but only {available} are known")]
    MissingMoves {
        /// Position in the chain.
        index: usize,
        /// Moves covered through this heartbeat.
        covered: usize,
        /// Moves supplied.
        available: usize,
    },

    /// Root does not match the leaf prefix.
    #[error("anchor {index} root does not match the first {covered} leaves")]
    RootMismatch {
        /// Position in the chain.
        index: usize,
        /// Leaves covered.
        covered: usize,
    },

    /// A packed record does not describe the committed move.
    #[error("move {sequence} does not match its heartbeat record")]
    RecordMismatch {
        /// Move sequence.
        sequence: u32,
    },

    /// Final move total disagrees with the heartbeats.
    #[error("final reports {reported} moves, heartbeats carry {actual}")]
    MoveCountMismatch {
        /// Value in the Final.
        reported: u8,
        /// Value counted.
        actual: usize,
    },
}

fn decode_all(records: &[AnchorRecord]) -> Result<Vec<Anchor>, ChainError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let anchor = Anchor::decode(&record.payload).map_err(|source| ChainError::Codec { index, source })?;
            if anchor.kind() != record.kind {
                return Err(ChainError::KindMismatch {
                    index,
                    recorded: record.kind,
                    decoded: anchor.kind(),
                });
            }
            Ok(anchor)
        })
        .collect()
}

/// Verify chain structure. Records must be in submission order.
pub fn verify_chain(records: &[AnchorRecord]) -> Result<ChainSummary, ChainError> {
    let first = records.first().ok_or(ChainError::Empty)?;
    let anchors = decode_all(records)?;

    let mut seen = BTreeSet::new();
    let mut heartbeats = 0;
    let mut total_moves = 0;
    let mut outcome = None;

    for (index, (record, anchor)) in records.iter().zip(&anchors).enumerate() {
        if !seen.insert(record.tx_id) {
            return Err(ChainError::DuplicateTx(hex::encode(record.tx_id)));
        }
        if outcome.is_some() {
            return Err(ChainError::FinalNotLast(index - 1));
        }

        match anchor {
            Anchor::Genesis(_) => {
                if index != 0 {
                    return Err(ChainError::Genesis(index));
                }
                continue;
            }
            _ if index == 0 => return Err(ChainError::Genesis(0)),
            Anchor::Heartbeat(hb) => {
                heartbeats += 1;
                total_moves += hb.moves.len();
            }
            Anchor::Final(fin) => {
                if fin.genesis_tx_id != first.tx_id {
                    return Err(ChainError::GenesisMismatch);
                }
                outcome = Some(fin.outcome);
            }
        }

        let expected_prev = records[index - 1].tx_id;
        if anchor.prev_tx_id() != Some(&expected_prev) || record.prev_tx_id != Some(expected_prev) {
            return Err(ChainError::BrokenLink { index });
        }
    }

    Ok(ChainSummary {
        genesis_tx_id: first.tx_id,
        head_tx_id: records[records.len() - 1].tx_id,
        heartbeats,
        total_moves,
        outcome,
    })
}

/// Re-derive every anchored root from the committed moves.
///
/// `moves` must be the full ordered move log the chain claims to cover.
pub fn verify_prefix_roots(moves: &[Move], records: &[AnchorRecord]) -> Result<(), ChainError> {
    let anchors = decode_all(records)?;
    let leaves: Vec<Hash32> = moves.iter().map(Move::leaf_hash).collect();
    let mut covered = 0usize;
    let mut prev_timestamp = 0u64;

    for (index, anchor) in anchors.iter().enumerate() {
        match anchor {
            Anchor::Genesis(_) => {}
            Anchor::Heartbeat(hb) => {
                let end = covered + hb.moves.len();
                if end > moves.len() {
                    return Err(ChainError::MissingMoves { index, covered: end, available: moves.len() });
                }
                for (record, mv) in hb.moves.iter().zip(&moves[covered..end]) {
                    if *record != MoveRecord::from_move(mv, prev_timestamp) {
                        return Err(ChainError::RecordMismatch { sequence: mv.sequence });
                    }
                    prev_timestamp = mv.timestamp_ms;
                }
                covered = end;
                if root_of(&leaves[..covered]) != hb.merkle_root {
                    return Err(ChainError::RootMismatch { index, covered });
                }
            }
            Anchor::Final(fin) => {
                if root_of(&leaves[..covered]) != fin.merkle_root {
                    return Err(ChainError::RootMismatch { index, covered });
                }
                let expected = u8::try_from(covered).unwrap_or(u8::MAX);
                if fin.total_moves != expected {
                    return Err(ChainError::MoveCountMismatch { reported: fin.total_moves, actual: covered });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::sha256;
    use crate::proof::anchor::tests::sample_genesis;
    use crate::proof::anchor::{FinalAnchor, HeartbeatAnchor};
    use crate::proof::moves::tests::sample_move;

    struct Builder {
        records: Vec<AnchorRecord>,
        moves: Vec<Move>,
        prev_ts: u64,
    }

    impl Builder {
        fn new() -> Self {
            let payload = sample_genesis().encode();
            let tx_id = sha256(&payload);
            Self {
                records: vec![AnchorRecord { kind: AnchorKind::Genesis, payload, tx_id, prev_tx_id: None }],
                moves: Vec::new(),
                prev_ts: 0,
            }
        }

        fn head(&self) -> TxId {
            self.records[self.records.len() - 1].tx_id
        }

        fn heartbeat(&mut self, n: u32) {
            let start = self.moves.len() as u32;
            let mut records = Vec::new();
            for seq in start..start + n {
                let mv = sample_move(seq);
                records.push(MoveRecord::from_move(&mv, self.prev_ts));
                self.prev_ts = mv.timestamp_ms;
                self.moves.push(mv);
            }
            let leaves: Vec<Hash32> = self.moves.iter().map(Move::leaf_hash).collect();
            let hb = HeartbeatAnchor {
                merkle_root: root_of(&leaves),
                prev_tx_id: self.head(),
                moves: records,
                delta_block: None,
                delta_nist: None,
            };
            self.push(AnchorKind::Heartbeat, hb.encode().unwrap());
        }

        fn finalize(&mut self) {
            let leaves: Vec<Hash32> = self.moves.iter().map(Move::leaf_hash).collect();
            let fin = FinalAnchor {
                merkle_root: root_of(&leaves),
                genesis_tx_id: self.records[0].tx_id,
                prev_tx_id: self.head(),
                result_leaf: [0; 32],
                score: 10,
                coins: 2,
                race_time_ms: 5_000,
                outcome: Outcome::Complete,
                total_moves: self.moves.len() as u8,
            };
            self.push(AnchorKind::Final, fin.encode());
        }

        fn push(&mut self, kind: AnchorKind, payload: Vec<u8>) {
            let prev = self.head();
            let tx_id = sha256(&[payload.as_slice(), prev.as_slice()].concat());
            self.records.push(AnchorRecord { kind, payload, tx_id, prev_tx_id: Some(prev) });
        }
    }

    #[test]
    fn test_valid_chain() {
        let mut b = Builder::new();
        b.heartbeat(10);
        b.heartbeat(0);
        b.heartbeat(4);
        b.finalize();

        let summary = verify_chain(&b.records).unwrap();
        assert_eq!(summary.heartbeats, 3);
        assert_eq!(summary.total_moves, 14);
        assert_eq!(summary.outcome, Some(Outcome::Complete));
        assert_eq!(summary.genesis_tx_id, b.records[0].tx_id);
        verify_prefix_roots(&b.moves, &b.records).unwrap();
    }

    #[test]
    fn test_broken_link_detected() {
        let mut b = Builder::new();
        b.heartbeat(2);
        b.heartbeat(2);
        b.records.swap(1, 2);
        assert!(matches!(verify_chain(&b.records), Err(ChainError::BrokenLink { .. })));
    }

    #[test]
    fn test_must_start_with_single_genesis() {
        let mut b = Builder::new();
        b.heartbeat(1);
        assert_eq!(verify_chain(&b.records[1..]), Err(ChainError::Genesis(0)));

        let mut b = Builder::new();
        let payload = sample_genesis().encode();
        b.push(AnchorKind::Genesis, payload);
        assert_eq!(verify_chain(&b.records), Err(ChainError::Genesis(1)));
        assert_eq!(verify_chain(&[]), Err(ChainError::Empty));
    }

    #[test]
    fn test_final_must_be_last() {
        let mut b = Builder::new();
        b.heartbeat(1);
        b.finalize();
        b.heartbeat(1);
        assert_eq!(verify_chain(&b.records), Err(ChainError::FinalNotLast(2)));
    }

    #[test]
    fn test_tampered_move_breaks_prefix_root() {
        let mut b = Builder::new();
        b.heartbeat(3);
        b.heartbeat(3);
        let mut moves = b.moves.clone();
        moves[4].block_hash = [0xEE; 32];
        assert_eq!(
            verify_prefix_roots(&moves, &b.records),
            Err(ChainError::RootMismatch { index: 2, covered: 6 })
        );
        assert!(matches!(
            verify_prefix_roots(&b.moves[..4], &b.records),
            Err(ChainError::MissingMoves { .. })
        ));
    }

    #[test]
    fn test_kind_mismatch_and_codec_errors() {
        let mut b = Builder::new();
        b.heartbeat(1);
        b.records[1].kind = AnchorKind::Final;
        assert!(matches!(verify_chain(&b.records), Err(ChainError::KindMismatch { index: 1, .. })));

        b.records[1].payload[0] = 9;
        assert!(matches!(
            verify_chain(&b.records),
            Err(ChainError::Codec { index: 1, source: AnchorCodecError::UnsupportedVersion(9) })
        ));
    }
}
