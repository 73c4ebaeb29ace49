//! Session Phase Machine
//!
//! ```text
//!   Idle ──► Initializing ──► Countdown ──► Running ──► Ended
//!    ▲                                                   │
//!    └──────────────────────── reset() ──────────────────┘
//! ```
//!
//! The countdown runs on a local clock for smooth display while ledger blocks
//! calibrate the DAA baseline. On completion the window is fixed from the
//! last observed DAA score and never recomputed. During Running only strictly
//! increasing DAA scores are accepted.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SessionConfig;

/// Session phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No game in progress.
    Idle,
    /// Preparing entropy and funding.
    Initializing,
    /// Counting down to start.
    Countdown,
    /// Race in progress.
    Running,
    /// Race over.
    Ended,
}

/// Phase machine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Transition not allowed from the current phase.
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current phase.
        from: Phase,
        /// Requested phase.
        to: Phase,
    },

    /// Countdown finished with no DAA score to anchor the window on.
    #[error("no DAA score observed")]
    NoDaaScore,
}

/// Result of feeding a DAA score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DaaUpdate {
    /// Duplicate, regression, or wrong phase.
    Ignored,
    /// First block of the countdown set the baseline.
    Calibrated {
        /// Baseline DAA score.
        baseline: u64,
    },
    /// Later countdown block.
    Observed {
        /// Score observed.
        daa_score: u64,
    },
    /// Accepted Running update.
    Progress {
        /// Accepted score.
        daa_score: u64,
        /// Fraction of the window elapsed, in `[0, 1]`.
        progress: f64,
        /// DAA units left.
        remaining: u64,
        /// Window reached; phase is now Ended.
        finished: bool,
    },
}

/// Countdown display state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountdownProgress {
    /// Time left (ms).
    pub remaining_ms: u64,
    /// Fraction elapsed.
    pub progress: f64,
}

/// Phase and DAA clock of one session.
#[derive(Clone, Debug)]
pub struct SessionState {
    phase: Phase,
    daa_duration: u64,
    countdown_ms: u64,
    countdown_started_ms: Option<u64>,
    baseline_daa: Option<u64>,
    last_observed_daa: Option<u64>,
    start_daa: Option<u64>,
    end_daa: Option<u64>,
    current_daa: u64,
}

impl SessionState {
    /// Idle state.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            phase: Phase::Idle,
            daa_duration: config.daa_duration,
            countdown_ms: config.countdown_ms,
            countdown_started_ms: None,
            baseline_daa: None,
            last_observed_daa: None,
            start_daa: None,
            end_daa: None,
            current_daa: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// First DAA score of the window.
    pub fn start_daa(&self) -> Option<u64> {
        self.start_daa
    }

    /// Last DAA score of the window.
    pub fn end_daa(&self) -> Option<u64> {
        self.end_daa
    }

    /// Last accepted DAA score.
    pub fn current_daa(&self) -> u64 {
        self.current_daa
    }

    /// First block observed during the countdown.
    pub fn baseline_daa(&self) -> Option<u64> {
        self.baseline_daa
    }

    fn transition(&mut self, allowed: &[Phase], to: Phase) -> Result<(), StateError> {
        if !allowed.contains(&self.phase) {
            return Err(StateError::InvalidTransition { from: self.phase, to });
        }
        debug!(from = ?self.phase, to = ?to, "Session phase");
        self.phase = to;
        Ok(())
    }

    /// Idle → Initializing.
    pub fn begin_initializing(&mut self) -> Result<(), StateError> {
        self.transition(&[Phase::Idle], Phase::Initializing)
    }

    /// Initializing → Countdown.
    pub fn start_countdown(&mut self, now_ms: u64) -> Result<(), StateError> {
        self.transition(&[Phase::Initializing], Phase::Countdown)?;
        self.countdown_started_ms = Some(now_ms);
        Ok(())
    }

    /// Local countdown display.
    pub fn countdown_progress(&self, now_ms: u64) -> CountdownProgress {
        let elapsed = self
            .countdown_started_ms
            .map(|started| now_ms.saturating_sub(started))
            .unwrap_or(0)
            .min(self.countdown_ms);
        let progress = if self.countdown_ms == 0 {
            1.0
        } else {
            elapsed as f64 / self.countdown_ms as f64
        };
        CountdownProgress { remaining_ms: self.countdown_ms - elapsed, progress }
    }

    /// Countdown → Running. The window is fixed from the last observed DAA
    /// score, or `fallback_daa` if no block arrived during the countdown.
    pub fn complete_countdown(&mut self, fallback_daa: Option<u64>) -> Result<(u64, u64), StateError> {
        if self.phase != Phase::Countdown {
            return Err(StateError::InvalidTransition { from: self.phase, to: Phase::Running });
        }
        let start = self
            .last_observed_daa
            .into_iter()
            .chain(fallback_daa)
            .max()
            .ok_or(StateError::NoDaaScore)?;
        self.transition(&[Phase::Countdown], Phase::Running)?;

        let end = start + self.daa_duration;
        self.start_daa = Some(start);
        self.end_daa = Some(end);
        self.current_daa = start;
        info!(start_daa = start, end_daa = end, "DAA window fixed");
        Ok((start, end))
    }

    /// Feed a DAA score from the block stream.
    pub fn on_daa_score(&mut self, daa_score: u64) -> DaaUpdate {
        match self.phase {
            Phase::Countdown => {
                let newer = self.last_observed_daa.map_or(true, |last| daa_score > last);
                if newer {
                    self.last_observed_daa = Some(daa_score);
                }
                if self.baseline_daa.is_none() {
                    self.baseline_daa = Some(daa_score);
                    DaaUpdate::Calibrated { baseline: daa_score }
                } else if newer {
                    DaaUpdate::Observed { daa_score }
                } else {
                    DaaUpdate::Ignored
                }
            }
            Phase::Running => {
                if daa_score <= self.current_daa {
                    return DaaUpdate::Ignored;
                }
                self.current_daa = daa_score;
                let remaining = self.remaining();
                let finished = remaining == 0;
                if finished {
                    self.phase = Phase::Ended;
                    info!(daa_score, "DAA window reached");
                }
                DaaUpdate::Progress { daa_score, progress: self.progress(), remaining, finished }
            }
            _ => DaaUpdate::Ignored,
        }
    }

    /// DAA units left in the window.
    pub fn remaining(&self) -> u64 {
        self.end_daa.map_or(self.daa_duration, |end| end.saturating_sub(self.current_daa))
    }

    /// `(total - remaining) / total`, clamped to `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.start_daa.is_none() || self.daa_duration == 0 {
            return 0.0;
        }
        let done = self.daa_duration.saturating_sub(self.remaining());
        (done as f64 / self.daa_duration as f64).clamp(0.0, 1.0)
    }

    /// Any active phase → Ended.
    pub fn end(&mut self) -> Result<(), StateError> {
        self.transition(&[Phase::Initializing, Phase::Countdown, Phase::Running], Phase::Ended)
    }

    /// Ended → Idle, clearing the window.
    pub fn reset(&mut self) -> Result<(), StateError> {
        self.transition(&[Phase::Ended], Phase::Idle)?;
        self.countdown_started_ms = None;
        self.baseline_daa = None;
        self.last_observed_daa = None;
        self.start_daa = None;
        self.end_daa = None;
        self.current_daa = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_at(start: u64) -> SessionState {
        let mut state = SessionState::new(&SessionConfig::default());
        state.begin_initializing().unwrap();
        state.start_countdown(0).unwrap();
        state.on_daa_score(start);
        state.complete_countdown(None).unwrap();
        state
    }

    #[test]
    fn test_monotonic_filter() {
        let mut state = running_at(100);
        let accepted: Vec<DaaUpdate> = [100, 100, 99, 101]
            .into_iter()
            .map(|s| state.on_daa_score(s))
            .filter(|u| *u != DaaUpdate::Ignored)
            .collect();
        assert_eq!(accepted.len(), 1);
        assert!(matches!(accepted[0], DaaUpdate::Progress { daa_score: 101, .. }));
        assert_eq!(state.current_daa(), 101);
    }

    #[test]
    fn test_progress_through_window() {
        let mut state = running_at(1000);
        assert_eq!(state.end_daa(), Some(2800));

        let mut progress = Vec::new();
        for score in [1200, 1800] {
            match state.on_daa_score(score) {
                DaaUpdate::Progress { progress: p, finished, .. } => {
                    assert!(!finished);
                    progress.push(p);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(state.phase(), Phase::Running);
        }
        assert!((progress[0] - 0.111).abs() < 1e-3);
        assert!((progress[1] - 0.444).abs() < 1e-3);

        match state.on_daa_score(2800) {
            DaaUpdate::Progress { progress, finished, remaining, .. } => {
                assert_eq!(progress, 1.0);
                assert_eq!(remaining, 0);
                assert!(finished);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.phase(), Phase::Ended);
    }

    #[test]
    fn test_window_uses_last_observed_not_first() {
        let mut state = SessionState::new(&SessionConfig::default());
        state.begin_initializing().unwrap();
        state.start_countdown(0).unwrap();
        assert_eq!(state.on_daa_score(500), DaaUpdate::Calibrated { baseline: 500 });
        assert_eq!(state.on_daa_score(517), DaaUpdate::Observed { daa_score: 517 });
        assert_eq!(state.on_daa_score(510), DaaUpdate::Ignored);

        // A stale fallback never moves the window backwards
        assert_eq!(state.complete_countdown(Some(505)).unwrap(), (517, 2317));
        assert_eq!(state.baseline_daa(), Some(500));
    }

    #[test]
    fn test_countdown_without_blocks_uses_fallback() {
        let mut state = SessionState::new(&SessionConfig::default());
        state.begin_initializing().unwrap();
        state.start_countdown(0).unwrap();
        assert_eq!(state.complete_countdown(None), Err(StateError::NoDaaScore));
        assert_eq!(state.phase(), Phase::Countdown);
        assert_eq!(state.complete_countdown(Some(42)).unwrap(), (42, 1842));
    }

    #[test]
    fn test_countdown_display() {
        let mut state = SessionState::new(&SessionConfig::default());
        state.begin_initializing().unwrap();
        state.start_countdown(1_000).unwrap();
        let p = state.countdown_progress(2_500);
        assert_eq!(p.remaining_ms, 1_500);
        assert_eq!(p.progress, 0.5);
        assert_eq!(state.countdown_progress(9_000).remaining_ms, 0);
    }

    #[test]
    fn test_transitions_are_one_way() {
        let mut state = SessionState::new(&SessionConfig::default());
        assert!(state.start_countdown(0).is_err());
        assert!(state.reset().is_err());
        state.begin_initializing().unwrap();
        assert!(state.begin_initializing().is_err());
        state.end().unwrap();
        assert!(state.end().is_err());
        state.reset().unwrap();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.start_daa(), None);
    }

    #[test]
    fn test_blocks_ignored_outside_clocked_phases() {
        let mut state = SessionState::new(&SessionConfig::default());
        assert_eq!(state.on_daa_score(10), DaaUpdate::Ignored);
        state.begin_initializing().unwrap();
        assert_eq!(state.on_daa_score(10), DaaUpdate::Ignored);
    }
}
