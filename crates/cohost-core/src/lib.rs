//! Co-host battle orchestration core.
//!
//! Pure Rust crate with no platform dependencies. Drives co-host links,
//! battle rounds, rankings and the round countdown for any number of live
//! sessions. Consumed by native UI shells via UniFFI bindings.

pub mod battle;
pub mod broadcaster;
pub mod clock;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod ranking;

pub use battle::{BattlePhase, BattleSession, BattleView, RoundInfo};
pub use broadcaster::{BroadcasterRegistry, RankingView, SessionSnapshot, StateBroadcaster, Subscription};
pub use clock::{ManualTimeSource, NetworkTimeSource, SessionClock, SystemTimeSource, TimeSource};
pub use config::CohostConfig;
pub use connection::{ConnectionRegistry, ConnectionView};
pub use errors::{CohostError, SignalingError};
pub use events::{
    BattleConfig, BattleOutcome, CandidateStatus, CoHostSignaling, Completion, ConnectionCandidate,
    ConnectionRequest, EndReason, Participant, ScoreMap, SessionEvent,
};
pub use orchestrator::{SessionHandle, SessionHub, SessionOrchestrator};
pub use ranking::RankedEntry;
