//! Bounded retry for ledger calls.
//!
//! Only transient [`LedgerError`]s are retried. Anything else is returned on
//! the first failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::client::LedgerError;

/// Delay growth between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

/// Retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Base delay (ms).
    pub base_delay_ms: u64,
    /// Delay cap (ms).
    pub max_delay_ms: u64,
    /// Growth.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Session start: 3 attempts, 800 ms * attempt.
    pub const fn session_start() -> Self {
        Self { max_attempts: 3, base_delay_ms: 800, max_delay_ms: 2_400, backoff: Backoff::Linear }
    }

    /// Heartbeats and Final: 4 attempts, 250 ms doubling, capped at 4 s.
    pub const fn heartbeat() -> Self {
        Self { max_attempts: 4, base_delay_ms: 250, max_delay_ms: 4_000, backoff: Backoff::Exponential }
    }

    /// UTXO split: 3 attempts, 1 s doubling, capped at 8 s.
    pub const fn utxo_refill() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, max_delay_ms: 8_000, backoff: Backoff::Exponential }
    }

    /// Single attempt.
    pub const fn no_retry() -> Self {
        Self { max_attempts: 1, base_delay_ms: 0, max_delay_ms: 0, backoff: Backoff::Linear }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.backoff {
            Backoff::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Retry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: LedgerError,
    },

    /// Non-transient failure; not retried.
    #[error("non-retryable ledger error: {0}")]
    Fatal(LedgerError),
}

impl RetryError {
    /// Underlying ledger error.
    pub fn ledger_error(&self) -> &LedgerError {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal(err) => err,
        }
    }
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                warn!(label, attempt, error = %err, "Non-retryable ledger error");
                return Err(RetryError::Fatal(err));
            }
            Err(err) if attempt >= max_attempts => {
                warn!(label, attempts = attempt, error = %err, "Retries exhausted");
                return Err(RetryError::Exhausted { attempts: attempt, last: err });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Transient ledger error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
