use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::SignalingError;

/// Participant id → score for the active round.
pub type ScoreMap = BTreeMap<String, u32>;

/// A live session (or its host) taking part in co-host links and battles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    None,
    Inviting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCandidate {
    pub participant: Participant,
    pub status: CandidateStatus,
}

/// Parameters of an outgoing co-host invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub target_id: String,
    /// Layout template id understood by the vendor SDK.
    pub template: u32,
    pub timeout_secs: u32,
    #[serde(default)]
    pub extension_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleConfig {
    pub duration_secs: u32,
    /// Round start on the shared clock, epoch milliseconds.
    pub start_time_ms: i64,
    #[serde(default)]
    pub extension_info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    TimeOver,
    AllMembersExited,
    InsufficientParticipants,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BattleOutcome {
    Victory,
    Draw,
    Defeat,
}

/// Inbound notifications from the signaling layer, dispatched by the host.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged {
        connected: Vec<Participant>,
    },
    RecommendedChanged {
        candidates: Vec<Participant>,
    },
    RequestReceived {
        inviter: Participant,
        extension_info: String,
    },
    RequestCancelled {
        inviter_id: String,
    },
    RequestAccepted {
        target_id: String,
    },
    RequestRejected {
        target_id: String,
    },
    RequestTimedOut {
        target_id: String,
    },
    BattleStarted {
        round_id: String,
        inviter: Participant,
        invitees: Vec<Participant>,
        config: BattleConfig,
    },
    BattleEnded {
        round_id: String,
        reason: EndReason,
        final_scores: Option<ScoreMap>,
    },
    ScoresSnapshot {
        round_id: String,
        scores: ScoreMap,
    },
    ScoreDelta {
        round_id: String,
        participant_id: String,
        score: u32,
    },
    PipModeChanged {
        enabled: bool,
    },
    /// The host process came back from suspension.
    Resumed,
}

/// Callback invoked once the signaling layer settles a request.
pub type Completion = Box<dyn FnOnce(Result<(), SignalingError>) + Send + 'static>;

/// Co-host signaling provided by the vendor SDK.
///
/// Implementations must be Send + Sync (called from tokio tasks) and must
/// invoke each completion at most once, from any thread.
pub trait CoHostSignaling: Send + Sync {
    fn request_connection(&self, session_id: &str, request: &ConnectionRequest, done: Completion);
    fn cancel_connection(&self, session_id: &str, target_id: &str, done: Completion);
    fn accept_connection(&self, session_id: &str, inviter_id: &str, done: Completion);
    fn reject_connection(&self, session_id: &str, inviter_id: &str, done: Completion);
    fn disconnect(&self, session_id: &str, done: Completion);
}
