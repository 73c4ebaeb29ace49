//! Anchor Processor
//!
//! Owns a session's move log and drives its anchor chain:
//!
//! ```text
//!   submit_genesis ──► Genesis ─┐
//!                               ▼
//!   queue_move ──► Merkle append ──► pending batch
//!                                       │ flush_heartbeat_if_due:
//!                                       │ 10 moves, or 500 ms since first
//!                                       ▼
//!                                   Heartbeat(prev = head) ──► ledger
//!                                       │ retries exhausted
//!                                       ▼
//!                                   stalled (retry_stalled) ── AnchorRetryNeeded
//!
//!   submit_final ──► flush remainder ──► Final(genesis, prev = head)
//! ```
//!
//! Every submission names the previous transaction, so anchors can only land
//! in order. While a heartbeat is stalled no later heartbeat is built.
//!
//! Time is passed in explicitly as session milliseconds.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::anchor::retry::{retry, RetryError};
use crate::config::AnchorConfig;
use crate::core::hash::{short_hex, GameId, Hash32, HashBuilder, TxId};
use crate::ledger::client::LedgerClient;
use crate::proof::anchor::{
    AnchorCodecError, AnchorKind, FinalAnchor, GenesisAnchor, HeartbeatAnchor, MoveRecord, Outcome, QrngTuple,
};
use crate::proof::chain::AnchorRecord;
use crate::proof::merkle::{MerkleAccumulator, MerkleError, MerkleProof};
use crate::proof::moves::Move;
use crate::session::events::SessionEvent;

/// Anchoring errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    /// Genesis could not be anchored.
    #[error("genesis anchor failed: {0}")]
    GenesisAnchorFailed(RetryError),

    /// Genesis already anchored for this session.
    #[error("genesis already anchored")]
    GenesisAlreadyAnchored,

    /// Chain operation before Genesis.
    #[error("no genesis anchor")]
    NoGenesis,

    /// Heartbeat gave up; kept for manual retry.
    #[error("heartbeat stalled: {0}")]
    Stalled(RetryError),

    /// Final could not be anchored.
    #[error("final anchor failed: {0}")]
    FinalFailed(RetryError),

    /// Session runs without anchoring.
    #[error("session is not anchored")]
    Degraded,

    /// Payload encoding failed.
    #[error(transparent)]
    Codec(#[from] AnchorCodecError),

    /// Move rejected by the log.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
}

/// Results written into the Final anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalInput {
    /// Score.
    pub score: u32,
    /// Coins collected.
    pub coins: u32,
    /// Race time (ms).
    pub race_time_ms: u32,
    /// Outcome.
    pub outcome: Outcome,
}

impl FinalInput {
    /// Leaf committing the results to the session and its move log.
    pub fn result_leaf(&self, game_id: &GameId, merkle_root: &Hash32, total_moves: u8) -> Hash32 {
        let mut h = HashBuilder::with_domain(b"KAS_RUNNER_RESULT_V1");
        h.update_bytes(game_id.as_bytes())
            .update_bytes(merkle_root)
            .update_u32(self.score)
            .update_u32(self.coins)
            .update_u32(self.race_time_ms)
            .update_u8(self.outcome as u8)
            .update_u8(total_moves);
        h.finalize()
    }
}

/// Closed chain returned by a successful Final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalReceipt {
    /// Final transaction.
    pub tx_id: TxId,
    /// Every anchor of the session in submission order.
    pub records: Vec<AnchorRecord>,
    /// Full move log.
    pub moves: Vec<Move>,
}

/// Outcome of a background Final, tagged with the session it belongs to.
#[derive(Debug)]
pub struct FinalCompletion {
    /// Session the Final was submitted for.
    pub game_id: GameId,
    /// Submission result.
    pub result: Result<FinalReceipt, AnchorError>,
}

#[derive(Clone, Debug)]
struct StalledHeartbeat {
    anchor: HeartbeatAnchor,
    move_count: usize,
}

/// Batches moves into heartbeats and drives the anchor chain.
pub struct AnchorProcessor {
    ledger: Arc<dyn LedgerClient>,
    config: AnchorConfig,
    events: broadcast::Sender<SessionEvent>,
    game_id: GameId,
    accumulator: MerkleAccumulator,
    moves: Vec<Move>,
    /// Moves covered by built heartbeats (sent or stalled).
    covered: usize,
    /// Moves covered by confirmed heartbeats.
    anchored: usize,
    pending: Vec<Move>,
    batch_started_ms: Option<u64>,
    last_anchor_ms: u64,
    prev_timestamp_ms: u64,
    delta_block: Option<Hash32>,
    delta_nist: Option<QrngTuple>,
    stalled: Option<StalledHeartbeat>,
    records: Vec<AnchorRecord>,
    degraded: bool,
}

impl AnchorProcessor {
    /// Processor for one session.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        config: AnchorConfig,
        events: broadcast::Sender<SessionEvent>,
        game_id: GameId,
    ) -> Self {
        Self {
            ledger,
            config,
            events,
            game_id,
            accumulator: MerkleAccumulator::new(),
            moves: Vec::new(),
            covered: 0,
            anchored: 0,
            pending: Vec::new(),
            batch_started_ms: None,
            last_anchor_ms: 0,
            prev_timestamp_ms: 0,
            delta_block: None,
            delta_nist: None,
            stalled: None,
            records: Vec::new(),
            degraded: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Session this processor anchors.
    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    /// Genesis transaction, once anchored.
    pub fn genesis_tx_id(&self) -> Option<TxId> {
        self.records.first().map(|r| r.tx_id)
    }

    /// Last confirmed transaction.
    pub fn head_tx_id(&self) -> Option<TxId> {
        self.records.last().map(|r| r.tx_id)
    }

    /// Confirmed anchors in order.
    pub fn records(&self) -> &[AnchorRecord] {
        &self.records
    }

    /// Full local move log.
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Moves covered by confirmed heartbeats.
    pub fn anchored_moves(&self) -> usize {
        self.anchored
    }

    /// Moves waiting for the next heartbeat.
    pub fn pending_moves(&self) -> usize {
        self.pending.len()
    }

    /// Current Merkle root over every committed move.
    pub fn root(&mut self) -> Hash32 {
        self.accumulator.root()
    }

    /// Inclusion proof for a committed move.
    pub fn proof(&mut self, sequence: u32) -> Option<MerkleProof> {
        self.accumulator.proof(sequence)
    }

    /// Whether a heartbeat is waiting for manual retry.
    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    /// Whether the session runs without anchoring.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Stop anchoring. Moves are still logged locally.
    pub fn set_degraded(&mut self) {
        if !self.degraded {
            warn!(game_id = %self.game_id, "Anchoring disabled, session is not auditable");
        }
        self.degraded = true;
        self.pending.clear();
        self.batch_started_ms = None;
        self.stalled = None;
    }

    /// Carry a new secondary-source block hash in the next heartbeat.
    pub fn note_block(&mut self, hash: Hash32) {
        self.delta_block = Some(hash);
    }

    /// Carry a new QRNG pulse in the next heartbeat.
    pub fn note_qrng(&mut self, tuple: QrngTuple) {
        self.delta_nist = Some(tuple);
    }

    // =========================================================================
    // Genesis
    // =========================================================================

    /// Anchor the session's Genesis with the session-start retry policy.
    pub async fn submit_genesis(&mut self, genesis: &GenesisAnchor, now_ms: u64) -> Result<TxId, AnchorError> {
        if !self.records.is_empty() {
            return Err(AnchorError::GenesisAlreadyAnchored);
        }
        let payload = genesis.encode();
        let ledger = Arc::clone(&self.ledger);

        let tx_id = retry(&self.config.genesis_retry, "genesis", |attempt| {
            debug!(attempt, "Submitting genesis");
            ledger.submit_anchor(&payload)
        })
        .await
        .map_err(AnchorError::GenesisAnchorFailed)?;

        info!(game_id = %self.game_id, tx = %short_hex(&tx_id), "Genesis anchored");
        self.records.push(AnchorRecord { kind: AnchorKind::Genesis, payload, tx_id, prev_tx_id: None });
        self.last_anchor_ms = now_ms;
        Ok(tx_id)
    }

    // =========================================================================
    // Heartbeats
    // =========================================================================

    /// Commit a move to the log and queue it for the next heartbeat.
    ///
    /// Never touches the ledger; batches go out from
    /// [`flush_heartbeat_if_due`](Self::flush_heartbeat_if_due).
    pub fn queue_move(&mut self, mv: Move, now_ms: u64) -> Result<Hash32, AnchorError> {
        let leaf = self.accumulator.append(&mv)?;
        self.moves.push(mv);
        if self.degraded {
            return Ok(leaf);
        }

        self.pending.push(mv);
        self.batch_started_ms.get_or_insert(now_ms);
        Ok(leaf)
    }

    /// Send every full batch, then the remainder once its window elapsed, or
    /// a keepalive when idle.
    ///
    /// Returns the last heartbeat tx id confirmed by this call. A stalled
    /// heartbeat is returned as [`AnchorError::Stalled`] and reported through
    /// `AnchorRetryNeeded`; the moves stay committed.
    pub async fn flush_heartbeat_if_due(&mut self, now_ms: u64) -> Result<Option<TxId>, AnchorError> {
        if self.degraded || self.stalled.is_some() || self.records.is_empty() {
            return Ok(None);
        }

        let batch_max = self.config.batch_max.max(1);
        let mut confirmed = None;
        while self.stalled.is_none() && self.pending.len() >= batch_max {
            confirmed = self.flush(now_ms).await?;
        }
        if confirmed.is_some() {
            return Ok(confirmed);
        }

        let due = match self.batch_started_ms {
            Some(started) if !self.pending.is_empty() => now_ms.saturating_sub(started) >= self.config.batch_ms,
            _ => false,
        };
        let keepalive = self.pending.is_empty()
            && now_ms.saturating_sub(self.last_anchor_ms) >= self.config.keepalive_ms;

        if due || keepalive {
            self.flush(now_ms).await
        } else {
            Ok(None)
        }
    }

    /// Resubmit the stalled heartbeat.
    pub async fn retry_stalled(&mut self, now_ms: u64) -> Result<Option<TxId>, AnchorError> {
        match self.stalled.take() {
            Some(StalledHeartbeat { anchor, move_count }) => {
                info!(moves = move_count, "Retrying stalled heartbeat");
                self.submit_heartbeat(anchor, move_count, now_ms).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Build and submit one heartbeat from up to `batch_max` pending moves.
    async fn flush(&mut self, now_ms: u64) -> Result<Option<TxId>, AnchorError> {
        if self.stalled.is_some() {
            return Ok(None);
        }
        let prev_tx_id = self.head_tx_id().ok_or(AnchorError::NoGenesis)?;

        let take = self.pending.len().min(self.config.batch_max.max(1));
        let batch: Vec<Move> = self.pending.drain(..take).collect();
        let mut records = Vec::with_capacity(batch.len());
        for mv in &batch {
            records.push(MoveRecord::from_move(mv, self.prev_timestamp_ms));
            self.prev_timestamp_ms = mv.timestamp_ms;
        }
        self.covered += batch.len();
        self.batch_started_ms = if self.pending.is_empty() { None } else { Some(now_ms) };

        let anchor = HeartbeatAnchor {
            merkle_root: self.accumulator.root_at(self.covered),
            prev_tx_id,
            moves: records,
            delta_block: self.delta_block.take(),
            delta_nist: self.delta_nist.take(),
        };
        self.submit_heartbeat(anchor, batch.len(), now_ms).await.map(Some)
    }

    async fn submit_heartbeat(
        &mut self,
        anchor: HeartbeatAnchor,
        move_count: usize,
        now_ms: u64,
    ) -> Result<TxId, AnchorError> {
        let payload = anchor.encode()?;
        let ledger = Arc::clone(&self.ledger);

        match retry(&self.config.heartbeat_retry, "heartbeat", |_| ledger.submit_anchor(&payload)).await {
            Ok(tx_id) => {
                debug!(moves = move_count, tx = %short_hex(&tx_id), "Heartbeat anchored");
                self.records.push(AnchorRecord {
                    kind: AnchorKind::Heartbeat,
                    payload,
                    tx_id,
                    prev_tx_id: Some(anchor.prev_tx_id),
                });
                self.anchored += move_count;
                self.last_anchor_ms = now_ms;
                let _ = self.events.send(SessionEvent::AnchorComplete {
                    kind: AnchorKind::Heartbeat,
                    tx_id: hex::encode(tx_id),
                    move_count,
                });
                Ok(tx_id)
            }
            Err(e) => {
                warn!(moves = move_count, error = %e, "Heartbeat stalled");
                let _ = self.events.send(SessionEvent::AnchorRetryNeeded { reason: e.to_string() });
                self.stalled = Some(StalledHeartbeat { anchor, move_count });
                Err(AnchorError::Stalled(e))
            }
        }
    }

    // =========================================================================
    // Final
    // =========================================================================

    /// Flush the remaining moves and close the chain.
    ///
    /// Consumes the processor so it can run as a background task; the
    /// completion carries the session id the Final was submitted for.
    pub async fn submit_final(mut self, input: FinalInput, now_ms: u64) -> FinalCompletion {
        let game_id = self.game_id;
        let result = self.close(input, now_ms).await;
        FinalCompletion { game_id, result }
    }

    async fn close(&mut self, input: FinalInput, now_ms: u64) -> Result<FinalReceipt, AnchorError> {
        if self.degraded {
            return Err(AnchorError::Degraded);
        }
        let genesis_tx_id = self.genesis_tx_id().ok_or(AnchorError::NoGenesis)?;

        self.retry_stalled(now_ms).await?;
        while !self.pending.is_empty() {
            self.flush(now_ms).await?;
        }

        let merkle_root = self.accumulator.root_at(self.covered);
        let total_moves = u8::try_from(self.covered).unwrap_or(u8::MAX);
        let prev_tx_id = self.head_tx_id().ok_or(AnchorError::NoGenesis)?;
        let fin = FinalAnchor {
            merkle_root,
            genesis_tx_id,
            prev_tx_id,
            result_leaf: input.result_leaf(&self.game_id, &merkle_root, total_moves),
            score: input.score,
            coins: input.coins,
            race_time_ms: input.race_time_ms,
            outcome: input.outcome,
            total_moves,
        };
        let payload = fin.encode();
        let ledger = Arc::clone(&self.ledger);

        let tx_id = retry(&self.config.heartbeat_retry, "final", |_| ledger.submit_anchor(&payload))
            .await
            .map_err(AnchorError::FinalFailed)?;

        info!(
            game_id = %self.game_id,
            tx = %short_hex(&tx_id),
            moves = self.covered,
            outcome = ?input.outcome,
            "Final anchored"
        );
        self.records.push(AnchorRecord { kind: AnchorKind::Final, payload, tx_id, prev_tx_id: Some(prev_tx_id) });

        Ok(FinalReceipt {
            tx_id,
            records: std::mem::take(&mut self.records),
            moves: std::mem::take(&mut self.moves),
        })
    }
}
