//! Runtime configuration.
//!
//! Every tunable of the core with its protocol default. [`CoreConfig::from_env`]
//! overrides selected values from `KAS_RUNNER_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::anchor::retry::RetryPolicy;
use crate::proof::anchor::SECONDARY_SOURCE_COUNT;

// =============================================================================
// PROTOCOL CONSTANTS
// =============================================================================

/// Sompi per KAS.
pub const SOMPI_PER_KAS: u64 = 100_000_000;

/// Game length in DAA score units.
pub const DAA_DURATION: u64 = 1800;

/// Countdown length (ms).
pub const COUNTDOWN_MS: u64 = 3000;

/// Heartbeat batch window (ms).
pub const ANCHOR_BATCH_MS: u64 = 500;

/// Max moves per heartbeat.
pub const ANCHOR_BATCH_MAX: usize = 10;

/// Idle time after which an empty heartbeat is sent (ms).
pub const HEARTBEAT_KEEPALIVE_MS: u64 = 2000;

/// Opponent silence before Warning (ms).
pub const ORANGE_THRESHOLD_MS: u64 = 5000;

/// Opponent silence before Forfeit (ms).
pub const FORFEIT_THRESHOLD_MS: u64 = 15000;

/// UI telemetry tick (ms).
pub const TELEMETRY_TICK_MS: u64 = 100;

/// QRNG capture cadence (ms).
pub const QRNG_INTERVAL_MS: u64 = 60_000;

/// Secondary-chain tip poll cadence (ms).
pub const SECONDARY_POLL_MS: u64 = 1000;

/// Cleanup wait for an in-flight Final (ms).
pub const FINAL_CLEANUP_TIMEOUT_MS: u64 = 5000;

/// Outputs in a prepared pool.
pub const UTXO_SPLIT_COUNT: usize = 10;

/// Minimum value of a usable output: 0.1 KAS.
pub const UTXO_USABLE_THRESHOLD_SOMPI: u64 = 10_000_000;

/// Pool health check interval (ms).
pub const UTXO_HEARTBEAT_MS: u64 = 30_000;

/// Delay before the first pool health check (ms).
pub const UTXO_FIRST_CHECK_DELAY_MS: u64 = 10_000;

/// Cost of anchoring one move: 0.0002 KAS.
pub const MOVE_COST_SOMPI: u64 = 20_000;

/// Runway (moves) below which a low-funds warning is raised.
pub const LOW_FUNDS_MOVES: u64 = 200;

/// Time allowed for the pool to become ready at game start (ms).
pub const UTXO_READY_TIMEOUT_MS: u64 = 15_000;

// =============================================================================
// COMPONENT CONFIGS
// =============================================================================

/// Session clock and controller timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Game length in DAA units.
    pub daa_duration: u64,
    /// Countdown length (ms).
    pub countdown_ms: u64,
    /// Telemetry tick (ms).
    pub telemetry_tick_ms: u64,
    /// QRNG capture cadence (ms).
    pub qrng_interval_ms: u64,
    /// Secondary-chain tip poll cadence (ms).
    pub secondary_poll_ms: u64,
    /// Cleanup wait for an in-flight Final (ms).
    pub final_cleanup_timeout_ms: u64,
    /// Pool readiness deadline for multiplayer (ms).
    pub utxo_ready_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            daa_duration: DAA_DURATION,
            countdown_ms: COUNTDOWN_MS,
            telemetry_tick_ms: TELEMETRY_TICK_MS,
            qrng_interval_ms: QRNG_INTERVAL_MS,
            secondary_poll_ms: SECONDARY_POLL_MS,
            final_cleanup_timeout_ms: FINAL_CLEANUP_TIMEOUT_MS,
            utxo_ready_timeout_ms: UTXO_READY_TIMEOUT_MS,
        }
    }
}

/// Anchor batching and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Batch window (ms).
    pub batch_ms: u64,
    /// Max moves per heartbeat.
    pub batch_max: usize,
    /// Keepalive interval (ms).
    pub keepalive_ms: u64,
    /// Genesis submission policy.
    pub genesis_retry: RetryPolicy,
    /// Heartbeat and Final submission policy.
    pub heartbeat_retry: RetryPolicy,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            batch_ms: ANCHOR_BATCH_MS,
            batch_max: ANCHOR_BATCH_MAX,
            keepalive_ms: HEARTBEAT_KEEPALIVE_MS,
            genesis_retry: RetryPolicy::session_start(),
            heartbeat_retry: RetryPolicy::heartbeat(),
        }
    }
}

/// UTXO pool sizing and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoConfig {
    /// Outputs to split into.
    pub split_count: usize,
    /// Usable output threshold (sompi).
    pub usable_threshold_sompi: u64,
    /// Health check interval (ms).
    pub heartbeat_ms: u64,
    /// First health check delay (ms).
    pub first_check_delay_ms: u64,
    /// Cost per anchored move (sompi).
    pub move_cost_sompi: u64,
    /// Low-funds runway threshold (moves).
    pub low_funds_moves: u64,
    /// Split retry policy.
    pub refill_retry: RetryPolicy,
}

impl Default for UtxoConfig {
    fn default() -> Self {
        Self {
            split_count: UTXO_SPLIT_COUNT,
            usable_threshold_sompi: UTXO_USABLE_THRESHOLD_SOMPI,
            heartbeat_ms: UTXO_HEARTBEAT_MS,
            first_check_delay_ms: UTXO_FIRST_CHECK_DELAY_MS,
            move_cost_sompi: MOVE_COST_SOMPI,
            low_funds_moves: LOW_FUNDS_MOVES,
            refill_retry: RetryPolicy::utxo_refill(),
        }
    }
}

/// VRF prefetch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyConfig {
    /// Queue is topped up to this many outputs.
    pub batch_size: usize,
    /// Refill below this depth.
    pub min_queue_depth: usize,
    /// Secondary-source hashes mixed into each proof.
    pub secondary_count: usize,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self { batch_size: 16, min_queue_depth: 4, secondary_count: SECONDARY_SOURCE_COUNT }
    }
}

/// Opponent integrity thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Silence before Warning (ms).
    pub orange_threshold_ms: u64,
    /// Silence before Forfeit (ms).
    pub forfeit_threshold_ms: u64,
    /// Expected Genesis DAA window.
    pub daa_duration: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            orange_threshold_ms: ORANGE_THRESHOLD_MS,
            forfeit_threshold_ms: FORFEIT_THRESHOLD_MS,
            daa_duration: DAA_DURATION,
        }
    }
}

/// Full core configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Session timers.
    pub session: SessionConfig,
    /// Anchor batching.
    pub anchor: AnchorConfig,
    /// UTXO pool.
    pub utxo: UtxoConfig,
    /// Entropy queue.
    pub entropy: EntropyConfig,
    /// Integrity thresholds.
    pub integrity: IntegrityConfig,
}

impl CoreConfig {
    /// Defaults overridden by `KAS_RUNNER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("KAS_RUNNER_DAA_DURATION") {
            config.session.daa_duration = v;
            config.integrity.daa_duration = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_COUNTDOWN_MS") {
            config.session.countdown_ms = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_ANCHOR_BATCH_MS") {
            config.anchor.batch_ms = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_ANCHOR_BATCH_MAX") {
            config.anchor.batch_max = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_UTXO_SPLIT_COUNT") {
            config.utxo.split_count = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_MOVE_COST_SOMPI") {
            config.utxo.move_cost_sompi = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_ORANGE_THRESHOLD_MS") {
            config.integrity.orange_threshold_ms = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_FORFEIT_THRESHOLD_MS") {
            config.integrity.forfeit_threshold_ms = v;
        }
        if let Some(v) = env_parse("KAS_RUNNER_ENTROPY_BATCH") {
            config.entropy.batch_size = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_carry_protocol_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.session.daa_duration, 1800);
        assert_eq!(config.anchor.batch_max, 10);
        assert_eq!(config.anchor.batch_ms, 500);
        assert_eq!(config.integrity.forfeit_threshold_ms, 15_000);
        assert_eq!(config.utxo.usable_threshold_sompi, SOMPI_PER_KAS / 10);
        assert_eq!(config.entropy.secondary_count, SECONDARY_SOURCE_COUNT);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("KAS_RUNNER_ANCHOR_BATCH_MAX", "4");
        std::env::set_var("KAS_RUNNER_DAA_DURATION", "not-a-number");
        let config = CoreConfig::from_env();
        std::env::remove_var("KAS_RUNNER_ANCHOR_BATCH_MAX");
        std::env::remove_var("KAS_RUNNER_DAA_DURATION");

        assert_eq!(config.anchor.batch_max, 4);
        assert_eq!(config.session.daa_duration, DAA_DURATION);
    }

    #[test]
    fn test_json_round_trip() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
