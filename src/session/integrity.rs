//! Opponent Integrity Monitor
//!
//! Watches one opponent's anchor stream in a multiplayer session.
//!
//! ```text
//!            silence > 5 s            silence > 15 s
//!   Ok ─────────────────────► Warning ─────────────────► Forfeit
//!    ▲                           │
//!    └──── valid anchor ─────────┘
//!
//!   broken prev link · unchanged root · wrong genesis · bad window ──► Cheat
//! ```
//!
//! Forfeit and Cheat are terminal. Any valid anchor counts as activity,
//! including a heartbeat with zero moves. Payloads that fail to decode are
//! reported and never count as activity.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::IntegrityConfig;
use crate::core::hash::{short_hex, Hash32, TxId};
use crate::ledger::client::PeerAnchor;
use crate::proof::anchor::{Anchor, AnchorCodecError, AnchorKind, Outcome};
use crate::session::events::SessionEvent;

/// Opponent standing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityState {
    /// Anchors arriving on time.
    Ok,
    /// Silent past the warning threshold.
    Warning,
    /// Silent past the forfeit threshold.
    Forfeit,
    /// Chain rules violated.
    Cheat,
}

impl IntegrityState {
    /// Forfeit or Cheat.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Forfeit | Self::Cheat)
    }

    /// Outcome a terminal state forces on the session.
    pub fn forced_outcome(self) -> Option<Outcome> {
        match self {
            Self::Forfeit => Some(Outcome::Forfeit),
            Self::Cheat => Some(Outcome::Cheat),
            Self::Ok | Self::Warning => None,
        }
    }
}

/// Chain rule an opponent broke.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CheatReason {
    /// Anchor does not reference the previous one.
    #[error("anchor does not extend the opponent's chain")]
    BrokenChain,

    /// Heartbeat added moves without changing the root.
    #[error("heartbeat carries moves but repeats the previous root")]
    StaleRoot,

    /// Final names a different genesis.
    #[error("final references a foreign genesis")]
    GenesisMismatch,

    /// Second genesis in one session.
    #[error("duplicate genesis")]
    DuplicateGenesis,

    /// Genesis window has the wrong length.
    #[error("genesis window spans {actual} DAA, expected {expected}")]
    DaaWindow {
        /// Required window.
        expected: u64,
        /// Window in the anchor.
        actual: u64,
    },
}

/// What one opponent anchor meant.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerVerdict {
    /// Valid anchor; counts as activity.
    Activity {
        /// Anchor type.
        kind: AnchorKind,
        /// Moves it carried.
        moves: usize,
    },
    /// Opponent closed their chain.
    Ended {
        /// Outcome from their Final.
        outcome: Outcome,
    },
    /// Version byte this build cannot read.
    Unsupported {
        /// Version received.
        version: u8,
    },
    /// Payload did not decode.
    Undecodable(AnchorCodecError),
    /// Chain rule broken; state is now Cheat.
    Cheat(CheatReason),
    /// Monitor already terminal or opponent finished.
    Ignored,
}

/// Integrity state for one opponent.
pub struct IntegrityMonitor {
    player_id: String,
    config: IntegrityConfig,
    events: broadcast::Sender<SessionEvent>,
    state: IntegrityState,
    last_activity_ms: Option<u64>,
    genesis_tx_id: Option<TxId>,
    head_tx_id: Option<TxId>,
    last_root: Option<Hash32>,
    move_count: usize,
    finished: bool,
}

impl IntegrityMonitor {
    /// Monitor for `player_id`.
    pub fn new(player_id: impl Into<String>, config: IntegrityConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            player_id: player_id.into(),
            config,
            events,
            state: IntegrityState::Ok,
            last_activity_ms: None,
            genesis_tx_id: None,
            head_tx_id: None,
            last_root: None,
            move_count: 0,
            finished: false,
        }
    }

    /// Opponent id.
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Current state.
    pub fn state(&self) -> IntegrityState {
        self.state
    }

    /// Moves the opponent has anchored.
    pub fn move_count(&self) -> usize {
        self.move_count
    }

    /// Opponent submitted a Final.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Start the silence clock.
    pub fn start(&mut self, now_ms: u64) {
        self.last_activity_ms.get_or_insert(now_ms);
    }

    /// Classify one opponent anchor.
    pub fn observe(&mut self, anchor: &PeerAnchor, now_ms: u64) -> PeerVerdict {
        if self.state.is_terminal() || self.finished {
            return PeerVerdict::Ignored;
        }

        let decoded = match Anchor::decode(&anchor.payload) {
            Ok(decoded) => decoded,
            Err(AnchorCodecError::UnsupportedVersion(version)) => {
                warn!(player = %self.player_id, version, "Opponent anchor has unsupported version");
                let _ = self.events.send(SessionEvent::UnsupportedAnchorVersion {
                    player_id: self.player_id.clone(),
                    version,
                });
                return PeerVerdict::Unsupported { version };
            }
            Err(e) => {
                warn!(player = %self.player_id, error = %e, "Opponent anchor undecodable");
                return PeerVerdict::Undecodable(e);
            }
        };

        let verdict = match decoded {
            Anchor::Genesis(genesis) => {
                if self.genesis_tx_id.is_some() {
                    return self.cheat(CheatReason::DuplicateGenesis);
                }
                let actual = genesis.end_daa.saturating_sub(genesis.start_daa);
                if actual != self.config.daa_duration {
                    return self.cheat(CheatReason::DaaWindow { expected: self.config.daa_duration, actual });
                }
                self.genesis_tx_id = Some(anchor.tx_id);
                PeerVerdict::Activity { kind: AnchorKind::Genesis, moves: 0 }
            }
            Anchor::Heartbeat(heartbeat) => {
                if self.head_tx_id != Some(heartbeat.prev_tx_id) {
                    return self.cheat(CheatReason::BrokenChain);
                }
                let moves = heartbeat.moves.len();
                if moves > 0 && self.last_root == Some(heartbeat.merkle_root) {
                    return self.cheat(CheatReason::StaleRoot);
                }
                self.last_root = Some(heartbeat.merkle_root);
                self.move_count += moves;
                PeerVerdict::Activity { kind: AnchorKind::Heartbeat, moves }
            }
            Anchor::Final(fin) => {
                if self.genesis_tx_id != Some(fin.genesis_tx_id) {
                    return self.cheat(CheatReason::GenesisMismatch);
                }
                if self.head_tx_id != Some(fin.prev_tx_id) {
                    return self.cheat(CheatReason::BrokenChain);
                }
                self.finished = true;
                info!(player = %self.player_id, outcome = ?fin.outcome, "Opponent finished");
                let _ = self.events.send(SessionEvent::OpponentEnd {
                    player_id: self.player_id.clone(),
                    outcome: fin.outcome,
                });
                PeerVerdict::Ended { outcome: fin.outcome }
            }
        };

        self.head_tx_id = Some(anchor.tx_id);
        self.last_activity_ms = Some(now_ms);
        debug!(player = %self.player_id, tx = %short_hex(&anchor.tx_id), "Opponent anchor accepted");
        if self.state == IntegrityState::Warning {
            self.transition(IntegrityState::Ok);
        }
        let _ = self.events.send(SessionEvent::OpponentStateUpdated {
            player_id: self.player_id.clone(),
            integrity: self.state,
            move_count: self.move_count,
        });
        verdict
    }

    /// Advance the silence clock.
    pub fn tick(&mut self, now_ms: u64) -> IntegrityState {
        if self.state.is_terminal() || self.finished {
            return self.state;
        }
        let Some(last) = self.last_activity_ms else {
            return self.state;
        };

        let silence = now_ms.saturating_sub(last);
        if silence > self.config.forfeit_threshold_ms {
            self.transition(IntegrityState::Forfeit);
        } else if silence > self.config.orange_threshold_ms {
            self.transition(IntegrityState::Warning);
        }
        self.state
    }

    fn cheat(&mut self, reason: CheatReason) -> PeerVerdict {
        warn!(player = %self.player_id, %reason, "Opponent chain violation");
        self.transition(IntegrityState::Cheat);
        PeerVerdict::Cheat(reason)
    }

    fn transition(&mut self, to: IntegrityState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!(player = %self.player_id, ?from, ?to, "Integrity state changed");
        let _ = self.events.send(SessionEvent::IntegrityStateChanged { player_id: self.player_id.clone(), from, to });
    }
}
