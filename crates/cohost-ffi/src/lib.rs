//! UniFFI bindings for cohost-core.
//!
//! Provides a CohostClient object that wraps the session hub, the shared
//! network clock and the host's signaling delegate into a single FFI-safe
//! interface.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use cohost_core::{
    self, BattleConfig as CoreBattleConfig, BattleOutcome as CoreBattleOutcome,
    BattlePhase as CoreBattlePhase, CandidateStatus as CoreCandidateStatus,
    ConnectionCandidate as CoreConnectionCandidate, ConnectionRequest as CoreConnectionRequest,
    EndReason as CoreEndReason, Participant as CoreParticipant, RankedEntry as CoreRankedEntry,
    RoundInfo as CoreRoundInfo, ScoreMap, SessionEvent as CoreSessionEvent, SessionSnapshot,
};
use futures_util::StreamExt;

uniffi::include_scaffolding!("cohost");

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using CohostClient.
/// On Android, stderr goes to logcat for debuggable builds.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cohost_core=debug,cohost_ffi=debug")),
            )
            .with_ansi(false)
            .try_init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl From<CoreParticipant> for Participant {
    fn from(p: CoreParticipant) -> Self {
        Self {
            id: p.id,
            name: p.name,
            avatar_url: p.avatar_url,
        }
    }
}

impl From<Participant> for CoreParticipant {
    fn from(p: Participant) -> Self {
        Self {
            id: p.id,
            name: p.name,
            avatar_url: p.avatar_url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    NotInvited,
    Inviting,
    Connected,
}

impl From<CoreCandidateStatus> for CandidateStatus {
    fn from(s: CoreCandidateStatus) -> Self {
        match s {
            CoreCandidateStatus::None => Self::NotInvited,
            CoreCandidateStatus::Inviting => Self::Inviting,
            CoreCandidateStatus::Connected => Self::Connected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionCandidate {
    pub participant: Participant,
    pub status: CandidateStatus,
}

impl From<CoreConnectionCandidate> for ConnectionCandidate {
    fn from(c: CoreConnectionCandidate) -> Self {
        Self {
            participant: c.participant.into(),
            status: c.status.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub target_id: String,
    pub template: u32,
    pub timeout_secs: u32,
    pub extension_info: String,
}

impl From<ConnectionRequest> for CoreConnectionRequest {
    fn from(r: ConnectionRequest) -> Self {
        Self {
            target_id: r.target_id,
            template: r.template,
            timeout_secs: r.timeout_secs,
            extension_info: r.extension_info,
        }
    }
}

impl From<CoreConnectionRequest> for ConnectionRequest {
    fn from(r: CoreConnectionRequest) -> Self {
        Self {
            target_id: r.target_id,
            template: r.template,
            timeout_secs: r.timeout_secs,
            extension_info: r.extension_info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BattleConfig {
    pub duration_secs: u32,
    pub start_time_ms: i64,
    pub extension_info: String,
}

impl From<BattleConfig> for CoreBattleConfig {
    fn from(c: BattleConfig) -> Self {
        Self {
            duration_secs: c.duration_secs,
            start_time_ms: c.start_time_ms,
            extension_info: c.extension_info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoreEntry {
    pub participant_id: String,
    pub score: u32,
}

fn score_map(entries: Vec<ScoreEntry>) -> ScoreMap {
    entries
        .into_iter()
        .map(|e| (e.participant_id, e.score))
        .collect()
}

#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub participant_id: String,
    pub score: u32,
    pub rank: u32,
}

impl From<CoreRankedEntry> for RankedEntry {
    fn from(e: CoreRankedEntry) -> Self {
        Self {
            participant_id: e.participant_id,
            score: e.score,
            rank: e.rank,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    TimeOver,
    AllMembersExited,
    InsufficientParticipants,
}

impl From<CoreEndReason> for EndReason {
    fn from(r: CoreEndReason) -> Self {
        match r {
            CoreEndReason::TimeOver => Self::TimeOver,
            CoreEndReason::AllMembersExited => Self::AllMembersExited,
            CoreEndReason::InsufficientParticipants => Self::InsufficientParticipants,
        }
    }
}

impl From<EndReason> for CoreEndReason {
    fn from(r: EndReason) -> Self {
        match r {
            EndReason::TimeOver => Self::TimeOver,
            EndReason::AllMembersExited => Self::AllMembersExited,
            EndReason::InsufficientParticipants => Self::InsufficientParticipants,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleOutcome {
    Victory,
    Draw,
    Defeat,
}

impl From<CoreBattleOutcome> for BattleOutcome {
    fn from(o: CoreBattleOutcome) -> Self {
        match o {
            CoreBattleOutcome::Victory => Self::Victory,
            CoreBattleOutcome::Draw => Self::Draw,
            CoreBattleOutcome::Defeat => Self::Defeat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BattlePhase {
    Idle,
    Starting,
    Running,
    Ending { reason: EndReason },
}

impl From<CoreBattlePhase> for BattlePhase {
    fn from(p: CoreBattlePhase) -> Self {
        match p {
            CoreBattlePhase::Idle => Self::Idle,
            CoreBattlePhase::Starting => Self::Starting,
            CoreBattlePhase::Running => Self::Running,
            CoreBattlePhase::Ending(reason) => Self::Ending {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundInfo {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub start_time_ms: i64,
    pub duration_secs: u32,
}

impl From<CoreRoundInfo> for RoundInfo {
    fn from(r: CoreRoundInfo) -> Self {
        Self {
            id: r.id,
            participant_ids: r.participant_ids,
            start_time_ms: r.start_time_ms,
            duration_secs: r.duration_secs,
        }
    }
}

/// Flattened [`SessionSnapshot`] for UI shells.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub connected: Vec<Participant>,
    pub candidates: Vec<ConnectionCandidate>,
    pub pending_target: Option<String>,
    pub incoming_request: Option<Participant>,
    pub phase: BattlePhase,
    pub round: Option<RoundInfo>,
    pub pip_mode: bool,
    pub ranking: Vec<RankedEntry>,
    pub outcome: Option<BattleOutcome>,
    pub ranking_final: bool,
    pub countdown_seconds: Option<u32>,
}

impl From<SessionSnapshot> for SessionState {
    fn from(s: SessionSnapshot) -> Self {
        Self {
            session_id: s.session_id,
            connected: s.connection.connected.into_iter().map(Participant::from).collect(),
            candidates: s
                .connection
                .candidates
                .into_iter()
                .map(ConnectionCandidate::from)
                .collect(),
            pending_target: s.connection.pending_target,
            incoming_request: s.connection.incoming_request.map(Participant::from),
            phase: s.battle.phase.into(),
            round: s.battle.round.map(RoundInfo::from),
            pip_mode: s.battle.pip_mode,
            ranking: s.ranking.entries.into_iter().map(RankedEntry::from).collect(),
            outcome: s.ranking.outcome.map(BattleOutcome::from),
            ranking_final: s.ranking.is_final,
            countdown_seconds: s.countdown_seconds,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CohostEvent {
    ConnectionChanged { connected: Vec<Participant> },
    RecommendedChanged { candidates: Vec<Participant> },
    RequestReceived { inviter: Participant, extension_info: String },
    RequestCancelled { inviter_id: String },
    RequestAccepted { target_id: String },
    RequestRejected { target_id: String },
    RequestTimedOut { target_id: String },
    BattleStarted {
        round_id: String,
        inviter: Participant,
        invitees: Vec<Participant>,
        config: BattleConfig,
    },
    BattleEnded {
        round_id: String,
        reason: EndReason,
        final_scores: Option<Vec<ScoreEntry>>,
    },
    ScoresSnapshot { round_id: String, scores: Vec<ScoreEntry> },
    ScoreDelta { round_id: String, participant_id: String, score: u32 },
    PipModeChanged { enabled: bool },
    Resumed,
}

fn participants(list: Vec<Participant>) -> Vec<CoreParticipant> {
    list.into_iter().map(CoreParticipant::from).collect()
}

impl From<CohostEvent> for CoreSessionEvent {
    fn from(e: CohostEvent) -> Self {
        match e {
            CohostEvent::ConnectionChanged { connected } => Self::ConnectionChanged {
                connected: participants(connected),
            },
            CohostEvent::RecommendedChanged { candidates } => Self::RecommendedChanged {
                candidates: participants(candidates),
            },
            CohostEvent::RequestReceived { inviter, extension_info } => Self::RequestReceived {
                inviter: inviter.into(),
                extension_info,
            },
            CohostEvent::RequestCancelled { inviter_id } => Self::RequestCancelled { inviter_id },
            CohostEvent::RequestAccepted { target_id } => Self::RequestAccepted { target_id },
            CohostEvent::RequestRejected { target_id } => Self::RequestRejected { target_id },
            CohostEvent::RequestTimedOut { target_id } => Self::RequestTimedOut { target_id },
            CohostEvent::BattleStarted {
                round_id,
                inviter,
                invitees,
                config,
            } => Self::BattleStarted {
                round_id,
                inviter: inviter.into(),
                invitees: participants(invitees),
                config: config.into(),
            },
            CohostEvent::BattleEnded {
                round_id,
                reason,
                final_scores,
            } => Self::BattleEnded {
                round_id,
                reason: reason.into(),
                final_scores: final_scores.map(score_map),
            },
            CohostEvent::ScoresSnapshot { round_id, scores } => Self::ScoresSnapshot {
                round_id,
                scores: score_map(scores),
            },
            CohostEvent::ScoreDelta {
                round_id,
                participant_id,
                score,
            } => Self::ScoreDelta {
                round_id,
                participant_id,
                score,
            },
            CohostEvent::PipModeChanged { enabled } => Self::PipModeChanged { enabled },
            CohostEvent::Resumed => Self::Resumed,
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CohostError {
    #[error("Invalid state: {msg}")]
    InvalidState { msg: String },
    #[error("Already pending: {msg}")]
    AlreadyPending { msg: String },
    #[error("Seats full")]
    SeatsFull,
    #[error("Round already active: {round_id}")]
    RoundAlreadyActive { round_id: String },
    #[error("Network failure ({code}): {msg}")]
    NetworkFailure { code: i32, msg: String },
    #[error("Session closed: {session_id}")]
    SessionClosed { session_id: String },
    #[error("Runtime error: {msg}")]
    Runtime { msg: String },
}

impl From<cohost_core::CohostError> for CohostError {
    fn from(e: cohost_core::CohostError) -> Self {
        tracing::warn!("CohostError: {e}");
        match e {
            cohost_core::CohostError::InvalidState(msg) => Self::InvalidState { msg },
            cohost_core::CohostError::AlreadyPending(msg) => Self::AlreadyPending { msg },
            cohost_core::CohostError::SeatsFull => Self::SeatsFull,
            cohost_core::CohostError::RoundAlreadyActive(round_id) => {
                Self::RoundAlreadyActive { round_id }
            }
            cohost_core::CohostError::NetworkFailure { code, message } => {
                Self::NetworkFailure { code, msg: message }
            }
            cohost_core::CohostError::SessionClosed(session_id) => {
                Self::SessionClosed { session_id }
            }
        }
    }
}

// ── Callback interfaces ───────────────────────────────────────────────

pub trait SessionObserver: Send + Sync {
    fn on_state(&self, state: SessionState);
}

/// Vendor co-host signaling, implemented by the host.
///
/// Every call must eventually settle its `done` handle. A handle released
/// without being settled reports a failure.
pub trait SignalingDelegate: Send + Sync {
    fn request_connection(&self, session_id: String, request: ConnectionRequest, done: Arc<PendingCompletion>);
    fn cancel_connection(&self, session_id: String, target_id: String, done: Arc<PendingCompletion>);
    fn accept_connection(&self, session_id: String, inviter_id: String, done: Arc<PendingCompletion>);
    fn reject_connection(&self, session_id: String, inviter_id: String, done: Arc<PendingCompletion>);
    fn disconnect(&self, session_id: String, done: Arc<PendingCompletion>);
}

/// One-shot completion handed to the host with each signaling call.
pub struct PendingCompletion {
    done: StdMutex<Option<cohost_core::Completion>>,
}

impl PendingCompletion {
    fn new(done: cohost_core::Completion) -> Arc<Self> {
        Arc::new(Self {
            done: StdMutex::new(Some(done)),
        })
    }

    fn take(&self) -> Option<cohost_core::Completion> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn succeed(&self) {
        if let Some(done) = self.take() {
            done(Ok(()));
        }
    }

    pub fn fail(&self, code: i32, msg: String) {
        if let Some(done) = self.take() {
            done(Err(cohost_core::SignalingError { code, message: msg }));
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        if let Some(done) = self.take() {
            tracing::warn!("signaling completion released unsettled");
            done(Err(cohost_core::SignalingError {
                code: -1,
                message: "completion released without result".into(),
            }));
        }
    }
}

// ── Bridge signaling: core trait → FFI delegate ───────────────────────

struct BridgeSignaling {
    delegate: Box<dyn SignalingDelegate>,
}

impl cohost_core::CoHostSignaling for BridgeSignaling {
    fn request_connection(
        &self,
        session_id: &str,
        request: &CoreConnectionRequest,
        done: cohost_core::Completion,
    ) {
        self.delegate.request_connection(
            session_id.to_string(),
            request.clone().into(),
            PendingCompletion::new(done),
        );
    }

    fn cancel_connection(&self, session_id: &str, target_id: &str, done: cohost_core::Completion) {
        self.delegate.cancel_connection(
            session_id.to_string(),
            target_id.to_string(),
            PendingCompletion::new(done),
        );
    }

    fn accept_connection(&self, session_id: &str, inviter_id: &str, done: cohost_core::Completion) {
        self.delegate.accept_connection(
            session_id.to_string(),
            inviter_id.to_string(),
            PendingCompletion::new(done),
        );
    }

    fn reject_connection(&self, session_id: &str, inviter_id: &str, done: cohost_core::Completion) {
        self.delegate.reject_connection(
            session_id.to_string(),
            inviter_id.to_string(),
            PendingCompletion::new(done),
        );
    }

    fn disconnect(&self, session_id: &str, done: cohost_core::Completion) {
        self.delegate
            .disconnect(session_id.to_string(), PendingCompletion::new(done));
    }
}

// ── ObserverHandle ────────────────────────────────────────────────────

/// Keeps an observer attached. Released (or unsubscribed) handles stop
/// delivery.
pub struct ObserverHandle {
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ObserverHandle {
    pub fn unsubscribe(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ── CohostClient: main FFI object ─────────────────────────────────────

pub struct CohostClient {
    hub: cohost_core::SessionHub,
    time: Arc<cohost_core::NetworkTimeSource>,
    rt: tokio::runtime::Runtime,
}

impl CohostClient {
    pub fn new(
        config_path: Option<String>,
        signaling: Box<dyn SignalingDelegate>,
    ) -> Result<Self, CohostError> {
        tracing::debug!("CohostClient::new() called");
        let rt = tokio::runtime::Runtime::new().map_err(|e| CohostError::Runtime { msg: e.to_string() })?;
        let config = match config_path {
            Some(path) => cohost_core::CohostConfig::load(path),
            None => cohost_core::CohostConfig::default(),
        };
        let time = Arc::new(cohost_core::NetworkTimeSource::new());
        let hub = cohost_core::SessionHub::new(
            config,
            Arc::new(BridgeSignaling { delegate: signaling }),
            time.clone(),
        );
        Ok(Self { hub, time, rt })
    }

    pub fn dispatch(&self, session_id: String, event: CohostEvent) -> Result<(), CohostError> {
        let _rt = self.rt.enter();
        self.hub
            .dispatch(&session_id, event.into())
            .map_err(CohostError::from)
    }

    /// Feed a server timestamp; countdowns follow the shared clock from now on.
    pub fn sync_server_time(&self, server_now_ms: i64) {
        self.time.sync(server_now_ms);
    }

    // Connection ops block until the signaling delegate settles the call,
    // so the delegate must not settle on the thread that made it.

    pub fn request_connection(
        &self,
        session_id: String,
        request: ConnectionRequest,
    ) -> Result<(), CohostError> {
        self.rt
            .block_on(async {
                self.hub
                    .session(&session_id)
                    .request_connection(request.into())
                    .await
            })
            .map_err(CohostError::from)
    }

    pub fn cancel_connection(&self, session_id: String, target_id: String) -> Result<(), CohostError> {
        self.rt
            .block_on(async { self.hub.session(&session_id).cancel_connection(&target_id).await })
            .map_err(CohostError::from)
    }

    pub fn accept_connection(&self, session_id: String, inviter_id: String) -> Result<(), CohostError> {
        self.rt
            .block_on(async { self.hub.session(&session_id).accept_connection(&inviter_id).await })
            .map_err(CohostError::from)
    }

    pub fn reject_connection(&self, session_id: String, inviter_id: String) -> Result<(), CohostError> {
        self.rt
            .block_on(async { self.hub.session(&session_id).reject_connection(&inviter_id).await })
            .map_err(CohostError::from)
    }

    pub fn exit_connection(&self, session_id: String) -> Result<(), CohostError> {
        self.rt
            .block_on(async { self.hub.session(&session_id).exit_connection().await })
            .map_err(CohostError::from)
    }

    pub fn snapshot(&self, session_id: String) -> Result<SessionState, CohostError> {
        self.rt
            .block_on(async { self.hub.session(&session_id).snapshot().await })
            .map(SessionState::from)
            .map_err(CohostError::from)
    }

    /// Deliver the current state now and every later change to `observer`,
    /// from a runtime thread.
    pub fn subscribe(&self, session_id: String, observer: Box<dyn SessionObserver>) -> Arc<ObserverHandle> {
        let _rt = self.rt.enter();
        let stream = self.hub.subscribe(&session_id).into_stream();
        let task = self.rt.spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(snapshot) = stream.next().await {
                observer.on_state(snapshot.into());
            }
            tracing::debug!("observer stream for {session_id} ended");
        });
        Arc::new(ObserverHandle {
            task: StdMutex::new(Some(task)),
        })
    }

    pub fn close_session(&self, session_id: String) -> bool {
        self.hub.close_session(&session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.hub.session_ids()
    }
}
