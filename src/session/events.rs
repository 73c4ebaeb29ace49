//! Session Events
//!
//! Everything the core tells UI and telemetry collaborators. One variant per
//! event name with a fixed payload shape; JSON form is
//! `{"type": "<kebab-name>", ...fields}`.

use serde::{Deserialize, Serialize};

use crate::core::hash::GameId;
use crate::proof::anchor::{AnchorKind, Outcome};
use crate::session::integrity::IntegrityState;

/// Event emitted by the session core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// Session created, countdown not started.
    SessionInitialized {
        /// Session id.
        game_id: GameId,
        /// Local player.
        player_id: String,
        /// Lobby session.
        is_multiplayer: bool,
    },

    /// Countdown progress.
    CountdownTick {
        /// Time left (ms).
        remaining_ms: u64,
        /// Fraction elapsed.
        progress: f64,
    },

    /// DAA window fixed; race is running.
    GameStart {
        /// First DAA score of the race.
        start_daa: u64,
        /// Last DAA score of the race.
        end_daa: u64,
    },

    /// Genesis confirmed; input is enabled.
    GenesisAnchored {
        /// Genesis transaction (hex).
        tx_id: String,
    },

    /// Accepted DAA update.
    ProgressUpdate {
        /// Accepted score.
        daa_score: u64,
        /// Fraction of the window elapsed.
        progress: f64,
        /// DAA units left.
        remaining: u64,
    },

    /// Periodic UI telemetry.
    Telemetry {
        /// Session time (ms).
        elapsed_ms: u64,
        /// Moves committed locally.
        moves: usize,
        /// Moves covered by confirmed heartbeats.
        anchored_moves: usize,
    },

    /// Opponent anchor observed.
    OpponentStateUpdated {
        /// Opponent.
        player_id: String,
        /// Opponent integrity state.
        integrity: IntegrityState,
        /// Moves the opponent has anchored.
        move_count: usize,
    },

    /// Opponent closed their chain.
    OpponentEnd {
        /// Opponent.
        player_id: String,
        /// Outcome from the opponent's Final.
        outcome: Outcome,
    },

    /// Local session ended.
    SessionEnd {
        /// Session id.
        game_id: GameId,
        /// Outcome.
        outcome: Outcome,
        /// Whether a Final anchor is being submitted.
        is_anchoring: bool,
    },

    /// An anchor was confirmed.
    AnchorComplete {
        /// Anchor type.
        kind: AnchorKind,
        /// Carrying transaction (hex).
        tx_id: String,
        /// Moves carried.
        move_count: usize,
    },

    /// A heartbeat exhausted its retries; manual retry is possible.
    AnchorRetryNeeded {
        /// Last error.
        reason: String,
    },

    /// Funding runway below threshold.
    LowFundsWarning {
        /// Wallet balance (sompi).
        balance_sompi: u64,
        /// Moves the balance can anchor.
        affordable_moves: u64,
    },

    /// Opponent integrity changed.
    IntegrityStateChanged {
        /// Opponent.
        player_id: String,
        /// Previous state.
        from: IntegrityState,
        /// New state.
        to: IntegrityState,
    },

    /// Pool refresh started.
    UtxoRefreshing {
        /// Usable outputs before refresh.
        usable_count: usize,
    },

    /// Pool refresh finished.
    UtxoRefreshComplete {
        /// Usable outputs after refresh.
        usable_count: usize,
    },

    /// Session continues without anchoring.
    Degraded {
        /// Why anchoring was lost.
        reason: String,
    },

    /// Session aborted before it could be anchored.
    SessionAborted {
        /// Session id.
        game_id: GameId,
        /// Why.
        reason: String,
    },

    /// Opponent anchor used a version this build cannot read.
    UnsupportedAnchorVersion {
        /// Opponent.
        player_id: String,
        /// Version byte received.
        version: u8,
    },
}

impl SessionEvent {
    /// Event name as used in the JSON `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionInitialized { .. } => "session-initialized",
            Self::CountdownTick { .. } => "countdown-tick",
            Self::GameStart { .. } => "game-start",
            Self::GenesisAnchored { .. } => "genesis-anchored",
            Self::ProgressUpdate { .. } => "progress-update",
            Self::Telemetry { .. } => "telemetry",
            Self::OpponentStateUpdated { .. } => "opponent-state-updated",
            Self::OpponentEnd { .. } => "opponent-end",
            Self::SessionEnd { .. } => "session-end",
            Self::AnchorComplete { .. } => "anchor-complete",
            Self::AnchorRetryNeeded { .. } => "anchor-retry-needed",
            Self::LowFundsWarning { .. } => "low-funds-warning",
            Self::IntegrityStateChanged { .. } => "integrity-state-changed",
            Self::UtxoRefreshing { .. } => "utxo-refreshing",
            Self::UtxoRefreshComplete { .. } => "utxo-refresh-complete",
            Self::Degraded { .. } => "degraded",
            Self::SessionAborted { .. } => "session-aborted",
            Self::UnsupportedAnchorVersion { .. } => "unsupported-anchor-version",
        }
    }
}
