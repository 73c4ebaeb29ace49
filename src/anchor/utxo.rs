//! UTXO Pool Manager
//!
//! Keeps enough pre-split outputs that parallel heartbeat transactions never
//! contend for the same input, and tracks how many moves the wallet can still
//! afford to anchor.
//!
//! ```text
//!   prepare() ── balance / split_count ──► split_utxos() ──► N usable outputs
//!   health task: sleep(first_check) ──► every heartbeat_ms ──► refill_if_needed()
//!                                                                  │
//!                              UtxoRefreshing ◄── not ready ───────┤
//!                              UtxoRefreshComplete ◄── split ──────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::anchor::retry::{retry, RetryError};
use crate::config::UtxoConfig;
use crate::ledger::client::{LedgerClient, LedgerError, Utxo};
use crate::session::events::SessionEvent;

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UtxoError {
    /// Ledger query failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Split transaction failed.
    #[error("utxo split failed: {0}")]
    Split(#[from] RetryError),

    /// Balance cannot fund a full pool.
    #[error("insufficient funds for pool: need {needed} sompi, have {available}")]
    InsufficientFunds {
        /// Sompi required.
        needed: u64,
        /// Sompi available.
        available: u64,
    },

    /// Pool did not become ready in time.
    #[error("utxo pool not ready within {0:?}")]
    Timeout(Duration),
}

/// Pool health snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// At least `split_count` usable outputs.
    pub is_ready: bool,
    /// Outputs at or above the usable threshold.
    pub usable_count: usize,
    /// All outputs.
    pub total_count: usize,
}

/// Funding runway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runway {
    /// Wallet balance (sompi).
    pub balance_sompi: u64,
    /// `balance / move_cost`.
    pub affordable_moves: u64,
    /// Below the low-funds threshold.
    pub low_funds: bool,
}

/// Maintains the split output set.
pub struct UtxoPoolManager {
    ledger: Arc<dyn LedgerClient>,
    config: UtxoConfig,
    events: broadcast::Sender<SessionEvent>,
    low_funds: AtomicBool,
}

impl UtxoPoolManager {
    /// Create a manager.
    pub fn new(ledger: Arc<dyn LedgerClient>, config: UtxoConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        Self { ledger, config, events, low_funds: AtomicBool::new(false) }
    }

    /// Classify a set of outputs.
    pub fn status_of(&self, utxos: &[Utxo]) -> PoolStatus {
        let usable_count = utxos
            .iter()
            .filter(|u| u.amount_sompi >= self.config.usable_threshold_sompi)
            .count();
        PoolStatus {
            is_ready: usable_count >= self.config.split_count,
            usable_count,
            total_count: utxos.len(),
        }
    }

    /// Current pool health.
    pub async fn status(&self) -> Result<PoolStatus, UtxoError> {
        let utxos = self.ledger.utxos().await?;
        Ok(self.status_of(&utxos))
    }

    /// Runway for a balance.
    pub fn runway_for(&self, balance_sompi: u64) -> Runway {
        let affordable_moves = balance_sompi / self.config.move_cost_sompi.max(1);
        Runway {
            balance_sompi,
            affordable_moves,
            low_funds: affordable_moves < self.config.low_funds_moves,
        }
    }

    /// Runway of the last funds check was short.
    pub fn is_low_funds(&self) -> bool {
        self.low_funds.load(Ordering::SeqCst)
    }

    /// Query the balance and emit `LowFundsWarning` if the runway is short.
    pub async fn check_funds(&self) -> Result<Runway, UtxoError> {
        let runway = self.runway_for(self.ledger.balance().await?);
        self.low_funds.store(runway.low_funds, Ordering::SeqCst);
        if runway.low_funds {
            warn!(
                balance_sompi = runway.balance_sompi,
                affordable_moves = runway.affordable_moves,
                "Low funds"
            );
            let _ = self.events.send(SessionEvent::LowFundsWarning {
                balance_sompi: runway.balance_sompi,
                affordable_moves: runway.affordable_moves,
            });
        }
        Ok(runway)
    }

    /// Split funds into a fresh pool unless it is already ready.
    pub async fn prepare(&self) -> Result<PoolStatus, UtxoError> {
        let status = self.status().await?;
        if status.is_ready {
            return Ok(status);
        }

        let count = self.config.split_count.max(1);
        let balance = self.ledger.balance().await?;
        // Keep one move's worth back for the split fee
        let amount_each = balance.saturating_sub(self.config.move_cost_sompi) / count as u64;
        if amount_each < self.config.usable_threshold_sompi {
            return Err(UtxoError::InsufficientFunds {
                needed: self.config.usable_threshold_sompi * count as u64 + self.config.move_cost_sompi,
                available: balance,
            });
        }

        let tx_id = retry(&self.config.refill_retry, "utxo-split", |_| {
            self.ledger.split_utxos(count, amount_each)
        })
        .await?;
        info!(count, amount_each, tx = %hex::encode(tx_id), "UTXO pool split");

        self.status().await
    }

    /// Prepare within `deadline`.
    pub async fn ensure_ready(&self, deadline: Duration) -> Result<PoolStatus, UtxoError> {
        tokio::time::timeout(deadline, self.prepare())
            .await
            .map_err(|_| UtxoError::Timeout(deadline))?
    }

    /// Refresh the pool if it is no longer ready. Returns whether a refresh ran.
    pub async fn refill_if_needed(&self) -> Result<bool, UtxoError> {
        self.check_funds().await?;
        let status = self.status().await?;
        if status.is_ready {
            debug!(usable = status.usable_count, "UTXO pool healthy");
            return Ok(false);
        }

        info!(usable = status.usable_count, "Refreshing UTXO pool");
        let _ = self.events.send(SessionEvent::UtxoRefreshing { usable_count: status.usable_count });
        let refreshed = self.prepare().await?;
        let _ = self.events.send(SessionEvent::UtxoRefreshComplete { usable_count: refreshed.usable_count });
        Ok(true)
    }

    /// Start the periodic health check. Stops once `stop` is set.
    pub fn spawn_health_task(self: Arc<Self>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(self.config.first_check_delay_ms)).await;
            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.heartbeat_ms.max(1)));

            loop {
                ticker.tick().await;
                if stop.load(Ordering::SeqCst) {
                    debug!("UTXO health task stopped");
                    break;
                }
                if let Err(e) = self.refill_if_needed().await {
                    warn!(error = %e, "UTXO health check failed");
                }
            }
        })
    }
}
