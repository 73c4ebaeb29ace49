//! Session orchestration.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SESSION LAYER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  state.rs      - Phase machine + DAA clock                  │
//! │  integrity.rs  - Opponent silence and chain checks          │
//! │  events.rs     - Events for UI and telemetry                │
//! │  controller.rs - Start, countdown, moves, end, Final        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod controller;
pub mod events;
pub mod integrity;
pub mod state;

pub use controller::{
    FinalStatus, GameSession, MultiplayerOptions, SessionController, SessionError, SessionResults,
};
pub use events::SessionEvent;
pub use integrity::{CheatReason, IntegrityMonitor, IntegrityState, PeerVerdict};
pub use state::{CountdownProgress, DaaUpdate, Phase, SessionState, StateError};
