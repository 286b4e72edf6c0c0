//! Per-session event loop composing the connection registry, the battle state
//! machine and the countdown, plus the session-id keyed hub that owns them.
//!
//! Every input for a session (signaling events, local commands, signaling
//! completions, timer firings) goes through one unbounded queue drained by a
//! single task, so state transitions never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::battle::{BattlePhase, BattleRound, BattleSession};
use crate::broadcaster::{BroadcasterRegistry, RankingView, SessionSnapshot, StateBroadcaster, Subscription};
use crate::clock::{Countdown, SessionClock, TimeSource};
use crate::config::CohostConfig;
use crate::connection::ConnectionRegistry;
use crate::errors::{CohostError, SignalingError};
use crate::events::{
    BattleConfig, CoHostSignaling, Completion, ConnectionRequest, EndReason, Participant,
    SessionEvent,
};
use crate::ranking;

type Reply = oneshot::Sender<Result<(), CohostError>>;

#[derive(Debug, Clone)]
enum SignalingOp {
    Invite,
    Cancel { target_id: String },
    Answer { inviter_id: String },
    Exit,
}

enum SessionCommand {
    Event(SessionEvent),
    RequestConnection {
        request: ConnectionRequest,
        respond_to: Reply,
    },
    CancelConnection {
        target_id: String,
        respond_to: Reply,
    },
    AnswerRequest {
        inviter_id: String,
        accept: bool,
        respond_to: Reply,
    },
    ExitConnection {
        respond_to: Reply,
    },
    Completed {
        op_id: Uuid,
        op: SignalingOp,
        result: Result<(), SignalingError>,
    },
    AnnouncementElapsed {
        round_id: String,
    },
    Tick {
        round_id: String,
        remaining: u32,
    },
    HoldElapsed {
        round_id: String,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a running session event loop.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Event(e) => write!(f, "Event({e:?})"),
            Self::RequestConnection { request, .. } => write!(f, "RequestConnection({})", request.target_id),
            Self::CancelConnection { target_id, .. } => write!(f, "CancelConnection({target_id})"),
            Self::AnswerRequest { inviter_id, accept, .. } => {
                write!(f, "AnswerRequest({inviter_id}, accept={accept})")
            }
            Self::ExitConnection { .. } => write!(f, "ExitConnection"),
            Self::Completed { op, result, .. } => write!(f, "Completed({op:?}, {result:?})"),
            Self::AnnouncementElapsed { round_id } => write!(f, "AnnouncementElapsed({round_id})"),
            Self::Tick { round_id, remaining } => write!(f, "Tick({round_id}, {remaining})"),
            Self::HoldElapsed { round_id } => write!(f, "HoldElapsed({round_id})"),
            Self::Snapshot { .. } => write!(f, "Snapshot"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue an inbound signaling event. Never blocks.
    pub fn dispatch(&self, event: SessionEvent) -> Result<(), CohostError> {
        self.send(SessionCommand::Event(event))
    }

    /// Invite another session to co-host.
    ///
    /// Resolves once the signaling layer confirmed delivery of the
    /// invitation; the answer arrives later as a session event.
    pub async fn request_connection(&self, request: ConnectionRequest) -> Result<(), CohostError> {
        self.call(|respond_to| SessionCommand::RequestConnection { request, respond_to })
            .await
    }

    pub async fn cancel_connection(&self, target_id: &str) -> Result<(), CohostError> {
        let target_id = target_id.to_string();
        self.call(|respond_to| SessionCommand::CancelConnection { target_id, respond_to })
            .await
    }

    pub async fn accept_connection(&self, inviter_id: &str) -> Result<(), CohostError> {
        self.answer(inviter_id, true).await
    }

    pub async fn reject_connection(&self, inviter_id: &str) -> Result<(), CohostError> {
        self.answer(inviter_id, false).await
    }

    /// Leave every co-host link of this session.
    pub async fn exit_connection(&self) -> Result<(), CohostError> {
        self.call(|respond_to| SessionCommand::ExitConnection { respond_to })
            .await
    }

    /// State after every command queued before this call was handled.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, CohostError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { respond_to })?;
        rx.await.map_err(|_| self.closed())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown);
    }

    async fn answer(&self, inviter_id: &str, accept: bool) -> Result<(), CohostError> {
        let inviter_id = inviter_id.to_string();
        self.call(|respond_to| SessionCommand::AnswerRequest {
            inviter_id,
            accept,
            respond_to,
        })
        .await
    }

    async fn call(&self, make: impl FnOnce(Reply) -> SessionCommand) -> Result<(), CohostError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(make(respond_to))?;
        rx.await.map_err(|_| self.closed())?
    }

    fn send(&self, cmd: SessionCommand) -> Result<(), CohostError> {
        self.tx.send(cmd).map_err(|_| self.closed())
    }

    fn closed(&self) -> CohostError {
        CohostError::SessionClosed(self.session_id.clone())
    }
}

/// State owner of one session. Lives inside its event loop task.
pub struct SessionOrchestrator {
    session_id: String,
    config: CohostConfig,
    registry: ConnectionRegistry,
    battle: BattleSession,
    clock: SessionClock,
    broadcaster: Arc<StateBroadcaster>,
    signaling: Arc<dyn CoHostSignaling>,
    tx: mpsc::WeakUnboundedSender<SessionCommand>,
    countdown: Option<Countdown>,
    phase_timer: Option<JoinHandle<()>>,
    pip_mode: bool,
    replies: HashMap<Uuid, Reply>,
}

impl SessionOrchestrator {
    /// Spawn the event loop of `session_id` on the current tokio runtime.
    ///
    /// The session id doubles as the "self" participant: outcomes are
    /// computed from this session's point of view.
    pub fn spawn(
        session_id: &str,
        config: CohostConfig,
        signaling: Arc<dyn CoHostSignaling>,
        time_source: Arc<dyn TimeSource>,
        broadcaster: Arc<StateBroadcaster>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            session_id: session_id.to_string(),
            registry: ConnectionRegistry::new(session_id, config.max_seats, config.invite_debounce()),
            config,
            battle: BattleSession::new(),
            clock: SessionClock::new(time_source),
            broadcaster,
            signaling,
            tx: tx.downgrade(),
            countdown: None,
            phase_timer: None,
            pip_mode: false,
            replies: HashMap::new(),
        };
        orchestrator.publish_all();
        tokio::spawn(orchestrator.run(rx));
        SessionHandle {
            session_id: session_id.to_string(),
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        tracing::info!("session {} event loop started", self.session_id);
        while let Some(cmd) = rx.recv().await {
            if matches!(cmd, SessionCommand::Shutdown) {
                break;
            }
            self.handle(cmd);
        }
        self.teardown();
        tracing::info!("session {} event loop ended", self.session_id);
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Event(event) => self.handle_event(event),
            SessionCommand::RequestConnection { request, respond_to } => {
                self.request_connection(request, respond_to)
            }
            SessionCommand::CancelConnection { target_id, respond_to } => {
                self.cancel_connection(target_id, respond_to)
            }
            SessionCommand::AnswerRequest {
                inviter_id,
                accept,
                respond_to,
            } => self.answer_request(inviter_id, accept, respond_to),
            SessionCommand::ExitConnection { respond_to } => self.exit_connection(respond_to),
            SessionCommand::Completed { op_id, op, result } => self.on_completed(op_id, op, result),
            SessionCommand::AnnouncementElapsed { round_id } => self.on_announcement_elapsed(&round_id),
            SessionCommand::Tick { round_id, remaining } => self.on_tick(&round_id, remaining),
            SessionCommand::HoldElapsed { round_id } => self.on_hold_elapsed(&round_id),
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.broadcaster.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        tracing::debug!("session {} event: {event:?}", self.session_id);
        match event {
            SessionEvent::ConnectionChanged { connected } => {
                if self.registry.on_connected_set_changed(connected) {
                    self.publish_connection();
                }
                self.enforce_quorum();
            }
            SessionEvent::RecommendedChanged { candidates } => {
                if self.registry.set_recommended(candidates) {
                    self.publish_connection();
                }
            }
            SessionEvent::RequestReceived { inviter, .. } => {
                if self.registry.on_request_received(inviter) {
                    self.publish_connection();
                }
            }
            SessionEvent::RequestCancelled { inviter_id } => {
                if self.registry.on_request_cancelled(&inviter_id) {
                    self.publish_connection();
                }
            }
            SessionEvent::RequestAccepted { target_id } => {
                if self.registry.on_request_accepted(&target_id) {
                    self.publish_connection();
                }
            }
            SessionEvent::RequestRejected { target_id } | SessionEvent::RequestTimedOut { target_id } => {
                if self.registry.on_request_declined(&target_id) {
                    self.publish_connection();
                }
            }
            SessionEvent::BattleStarted {
                round_id,
                inviter,
                invitees,
                config,
            } => self.on_battle_started(round_id, inviter, invitees, config),
            SessionEvent::BattleEnded {
                round_id,
                reason,
                final_scores,
            } => {
                if !self.battle.is_current(&round_id) {
                    // The start may still be in flight.
                    tracing::debug!("end of unknown round {round_id} recorded");
                    self.battle.mark_ended(&round_id);
                    return;
                }
                if let Some(scores) = final_scores {
                    self.battle.record_score_snapshot(&scores);
                }
                self.end_round(reason);
            }
            SessionEvent::ScoresSnapshot { round_id, scores } => self.on_scores(&round_id, |battle| {
                battle.record_score_snapshot(&scores)
            }),
            SessionEvent::ScoreDelta {
                round_id,
                participant_id,
                score,
            } => self.on_scores(&round_id, |battle| battle.apply_score_delta(&participant_id, score)),
            SessionEvent::PipModeChanged { enabled } => {
                self.pip_mode = enabled;
                self.publish_battle();
                self.resync_countdown();
            }
            SessionEvent::Resumed => self.resync_countdown(),
        }
    }

    fn on_battle_started(
        &mut self,
        round_id: String,
        inviter: Participant,
        invitees: Vec<Participant>,
        config: BattleConfig,
    ) {
        // A new round preempts the result display of the previous one.
        if matches!(self.battle.phase(), BattlePhase::Ending(_)) && !self.battle.has_ended(&round_id) {
            if let Some(previous) = self.battle.round().map(|r| r.id.clone()) {
                self.on_hold_elapsed(&previous);
            }
        }

        let participant_ids: BTreeSet<String> = std::iter::once(inviter.id)
            .chain(invitees.into_iter().map(|p| p.id))
            .collect();
        let round = BattleRound {
            id: round_id.clone(),
            participant_ids,
            timing: self.clock.timing(config.start_time_ms, config.duration_secs),
        };
        if let Err(e) = self.battle.start(round) {
            tracing::warn!("battle start {round_id} rejected: {e}");
            return;
        }
        self.publish_battle();
        self.publish_ranking(false);
        self.schedule(
            self.config.announcement_delay(),
            SessionCommand::AnnouncementElapsed { round_id },
        );
    }

    fn on_announcement_elapsed(&mut self, round_id: &str) {
        if !self.battle.begin_running(round_id) {
            return;
        }
        if self.enforce_quorum() {
            return;
        }
        self.publish_battle();
        self.start_countdown();
    }

    fn on_tick(&mut self, round_id: &str, remaining: u32) {
        if self.battle.phase() != BattlePhase::Running || !self.battle.is_current(round_id) {
            tracing::debug!("stale tick for {round_id}");
            return;
        }
        self.broadcaster.publish_countdown(Some(remaining));
        if remaining == 0 {
            self.end_round(EndReason::TimeOver);
        }
    }

    fn on_hold_elapsed(&mut self, round_id: &str) {
        if !self.battle.finish_ending(round_id) {
            return;
        }
        self.abort_phase_timer();
        self.publish_battle();
        self.broadcaster.publish_ranking(RankingView::default());
    }

    fn on_scores(&mut self, round_id: &str, apply: impl FnOnce(&mut BattleSession) -> bool) {
        if !self.battle.is_current(round_id) {
            tracing::debug!("scores for unknown round {round_id} ignored");
            return;
        }
        if apply(&mut self.battle) {
            self.publish_ranking(false);
        }
    }

    /// Force-end the active round if it lost its quorum. Returns true if
    /// the round was ended here.
    fn enforce_quorum(&mut self) -> bool {
        if !self.battle.phase().is_active() {
            return false;
        }
        // The own session is linked by definition, listed or not.
        let present = self.battle.connected_in_round(
            self.registry
                .connected()
                .iter()
                .map(|p| p.id.as_str())
                .filter(|id| *id != self.session_id)
                .chain(std::iter::once(self.session_id.as_str())),
        );
        if self.battle.enforce_quorum(present) {
            tracing::info!("session {} lost battle quorum ({present} left)", self.session_id);
            self.after_round_ended();
            return true;
        }
        false
    }

    fn end_round(&mut self, reason: EndReason) {
        if self.battle.end(reason) {
            self.after_round_ended();
        }
    }

    fn after_round_ended(&mut self) {
        self.countdown = None;
        self.abort_phase_timer();
        self.broadcaster.publish_countdown(None);
        self.publish_battle();
        self.publish_ranking(true);
        if let Some(round_id) = self.battle.round().map(|r| r.id.clone()) {
            self.schedule(
                self.config.ending_hold(),
                SessionCommand::HoldElapsed { round_id },
            );
        }
    }

    fn start_countdown(&mut self) {
        let Some(round) = self.battle.round() else {
            return;
        };
        let round_id = round.id.clone();
        let tx = self.tx.clone();
        self.countdown = Some(self.clock.spawn_countdown(
            round.timing,
            self.config.tick_interval(),
            move |remaining| {
                tx.upgrade().is_some_and(|tx| {
                    tx.send(SessionCommand::Tick {
                        round_id: round_id.clone(),
                        remaining,
                    })
                    .is_ok()
                })
            },
        ));
    }

    /// Recompute the countdown from elapsed time, e.g. after the process
    /// was suspended, and realign the tick task.
    fn resync_countdown(&mut self) {
        if self.battle.phase() != BattlePhase::Running {
            return;
        }
        let Some(round) = self.battle.round() else {
            return;
        };
        let remaining = self.clock.remaining_seconds(&round.timing);
        tracing::debug!("session {} countdown resynced to {remaining}s", self.session_id);
        self.broadcaster.publish_countdown(Some(remaining));
        if remaining == 0 {
            self.end_round(EndReason::TimeOver);
        } else {
            self.start_countdown();
        }
    }

    fn request_connection(&mut self, mut request: ConnectionRequest, respond_to: Reply) {
        if request.timeout_secs == 0 {
            request.timeout_secs = self.config.default_invite_timeout_secs;
        }
        let op_id = match self.registry.begin_request(&request, Instant::now()) {
            Ok(op_id) => op_id,
            Err(e) => {
                tracing::warn!("invite to {} rejected: {e}", request.target_id);
                let _ = respond_to.send(Err(e));
                return;
            }
        };
        tracing::info!("session {} inviting {}", self.session_id, request.target_id);
        self.publish_connection();
        self.replies.insert(op_id, respond_to);
        let done = self.completion(op_id, SignalingOp::Invite);
        self.signaling.request_connection(&self.session_id, &request, done);
    }

    fn cancel_connection(&mut self, target_id: String, respond_to: Reply) {
        if !self.registry.cancel_request(&target_id) {
            tracing::debug!("cancel for {target_id} with nothing pending");
            let _ = respond_to.send(Ok(()));
            return;
        }
        self.publish_connection();
        let op_id = Uuid::new_v4();
        self.replies.insert(op_id, respond_to);
        let done = self.completion(
            op_id,
            SignalingOp::Cancel {
                target_id: target_id.clone(),
            },
        );
        self.signaling.cancel_connection(&self.session_id, &target_id, done);
    }

    fn answer_request(&mut self, inviter_id: String, accept: bool, respond_to: Reply) {
        if let Err(e) = self.registry.begin_answer(&inviter_id) {
            tracing::warn!("answer to {inviter_id} rejected: {e}");
            let _ = respond_to.send(Err(e));
            return;
        }
        let op_id = Uuid::new_v4();
        self.replies.insert(op_id, respond_to);
        let done = self.completion(
            op_id,
            SignalingOp::Answer {
                inviter_id: inviter_id.clone(),
            },
        );
        if accept {
            self.signaling.accept_connection(&self.session_id, &inviter_id, done);
        } else {
            self.signaling.reject_connection(&self.session_id, &inviter_id, done);
        }
    }

    fn exit_connection(&mut self, respond_to: Reply) {
        match self.registry.begin_exit() {
            Ok(true) => {
                let op_id = Uuid::new_v4();
                self.replies.insert(op_id, respond_to);
                let done = self.completion(op_id, SignalingOp::Exit);
                self.signaling.disconnect(&self.session_id, done);
            }
            Ok(false) => {
                let _ = respond_to.send(Ok(()));
            }
            Err(e) => {
                let _ = respond_to.send(Err(e));
            }
        }
    }

    fn on_completed(&mut self, op_id: Uuid, op: SignalingOp, result: Result<(), SignalingError>) {
        let changed = match &op {
            SignalingOp::Invite => self.registry.settle_request(op_id, &result),
            SignalingOp::Cancel { target_id } => {
                self.registry.finish_cancel(target_id);
                false
            }
            SignalingOp::Answer { inviter_id } => self.registry.settle_answer(inviter_id, &result),
            SignalingOp::Exit => self.registry.settle_exit(&result),
        };
        if changed {
            self.publish_connection();
        }
        if matches!(op, SignalingOp::Exit) {
            self.enforce_quorum();
        }
        if let Err(e) = &result {
            tracing::warn!("session {} {op:?} failed: {e}", self.session_id);
        }
        match self.replies.remove(&op_id) {
            Some(reply) => {
                let _ = reply.send(result.map_err(CohostError::from));
            }
            None => tracing::debug!("completion {op_id} without caller"),
        }
    }

    /// Completion that posts the result back into this session's queue, or
    /// is discarded if the session is gone by then.
    fn completion(&self, op_id: Uuid, op: SignalingOp) -> Completion {
        let tx = self.tx.clone();
        let session_id = self.session_id.clone();
        Box::new(move |result| match tx.upgrade() {
            Some(tx) => {
                let _ = tx.send(SessionCommand::Completed { op_id, op, result });
            }
            None => tracing::debug!("completion for closed session {session_id} discarded"),
        })
    }

    fn schedule(&mut self, after: Duration, cmd: SessionCommand) {
        self.abort_phase_timer();
        let tx = self.tx.clone();
        self.phase_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(cmd);
            }
        }));
    }

    fn abort_phase_timer(&mut self) {
        if let Some(timer) = self.phase_timer.take() {
            timer.abort();
        }
    }

    fn teardown(&mut self) {
        self.countdown = None;
        self.abort_phase_timer();
        self.registry.clear();
        self.replies.clear();
    }

    fn publish_all(&self) {
        self.publish_connection();
        self.publish_battle();
        self.publish_ranking(false);
        self.broadcaster.publish_countdown(None);
    }

    fn publish_connection(&self) {
        self.broadcaster.publish_connection(self.registry.view());
    }

    fn publish_battle(&self) {
        let mut view = self.battle.view();
        view.pip_mode = self.pip_mode;
        self.broadcaster.publish_battle(view);
    }

    fn publish_ranking(&self, is_final: bool) {
        let entries = self.battle.ranking();
        let outcome = if is_final {
            ranking::outcome_for(&entries, &self.session_id)
        } else {
            None
        };
        self.broadcaster.publish_ranking(RankingView {
            entries,
            outcome,
            is_final,
        });
    }
}

struct HubInner {
    config: CohostConfig,
    signaling: Arc<dyn CoHostSignaling>,
    time_source: Arc<dyn TimeSource>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    broadcasters: BroadcasterRegistry,
}

impl HubInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle of `session_id`, spawning its event loop if needed. Runs
    /// under the sessions lock, which is always taken before the
    /// broadcaster registry's.
    fn session_locked(
        &self,
        sessions: &mut HashMap<String, SessionHandle>,
        session_id: &str,
    ) -> SessionHandle {
        if let Some(handle) = sessions.get(session_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        let broadcaster = self.broadcasters.get_or_create(session_id);
        let handle = SessionOrchestrator::spawn(
            session_id,
            self.config.clone(),
            self.signaling.clone(),
            self.time_source.clone(),
            broadcaster,
        );
        sessions.insert(session_id.to_string(), handle.clone());
        handle
    }

    fn close(&self, session_id: &str) -> bool {
        let handle = {
            let mut sessions = self.sessions();
            let handle = sessions.remove(session_id);
            self.broadcasters.remove(session_id);
            handle
        };
        match handle {
            Some(handle) => {
                tracing::info!("closing session {session_id}");
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    /// Grace period of `session_id` ran out. Closes it unless an observer
    /// attached again in the meantime.
    fn expire(&self, session_id: &str, epoch: u64) -> bool {
        let handle = {
            let mut sessions = self.sessions();
            if !self.broadcasters.remove_idle(session_id, epoch) {
                return false;
            }
            sessions.remove(session_id)
        };
        if let Some(handle) = handle {
            tracing::info!("closing idle session {session_id}");
            handle.shutdown();
        }
        true
    }
}

/// Sessions keyed by id: created on first use, torn down explicitly or
/// once their last observer has been gone for the grace period.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    pub fn new(
        config: CohostConfig,
        signaling: Arc<dyn CoHostSignaling>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let broadcasters = BroadcasterRegistry::new(config.observer_grace());
        let inner = Arc::new(HubInner {
            config,
            signaling,
            time_source,
            sessions: Mutex::new(HashMap::new()),
            broadcasters,
        });
        let weak: Weak<HubInner> = Arc::downgrade(&inner);
        inner.broadcasters.on_teardown(Arc::new(move |session_id: &str, epoch: u64| {
            if let Some(inner) = weak.upgrade() {
                inner.expire(session_id, epoch);
            }
        }));
        Self { inner }
    }

    pub fn config(&self) -> &CohostConfig {
        &self.inner.config
    }

    /// Handle of `session_id`, spawning its event loop if needed.
    pub fn session(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.inner.sessions();
        self.inner.session_locked(&mut sessions, session_id)
    }

    /// Attach an observer to `session_id`, spawning the session if needed.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let mut sessions = self.inner.sessions();
        self.inner.session_locked(&mut sessions, session_id);
        self.inner.broadcasters.subscribe(session_id)
    }

    pub fn dispatch(&self, session_id: &str, event: SessionEvent) -> Result<(), CohostError> {
        self.session(session_id).dispatch(event)
    }

    /// Tear down `session_id` now. Returns false if it was not running.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.inner.close(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions().keys().cloned().collect()
    }

    pub fn observer_count(&self, session_id: &str) -> usize {
        self.inner.broadcasters.observer_count(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::events::{BattleOutcome, CandidateStatus};

    const START: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingSignaling {
        calls: Mutex<Vec<String>>,
        held: Mutex<Vec<Completion>>,
        hold: bool,
    }

    impl RecordingSignaling {
        fn holding() -> Arc<Self> {
            Arc::new(Self {
                hold: true,
                ..Self::default()
            })
        }

        fn immediate() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn record(&self, call: String, done: Completion) {
            self.calls.lock().unwrap().push(call);
            if self.hold {
                self.held.lock().unwrap().push(done);
            } else {
                done(Ok(()));
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn complete_next(&self, result: Result<(), SignalingError>) {
            let done = self.held.lock().unwrap().remove(0);
            done(result);
        }
    }

    impl CoHostSignaling for RecordingSignaling {
        fn request_connection(&self, _session_id: &str, request: &ConnectionRequest, done: Completion) {
            self.record(format!("invite:{}", request.target_id), done);
        }

        fn cancel_connection(&self, _session_id: &str, target_id: &str, done: Completion) {
            self.record(format!("cancel:{target_id}"), done);
        }

        fn accept_connection(&self, _session_id: &str, inviter_id: &str, done: Completion) {
            self.record(format!("accept:{inviter_id}"), done);
        }

        fn reject_connection(&self, _session_id: &str, inviter_id: &str, done: Completion) {
            self.record(format!("reject:{inviter_id}"), done);
        }

        fn disconnect(&self, _session_id: &str, done: Completion) {
            self.record("disconnect".to_string(), done);
        }
    }

    fn make_hub(signaling: Arc<RecordingSignaling>, time: Option<i64>) -> SessionHub {
        SessionHub::new(
            CohostConfig::default(),
            signaling,
            Arc::new(ManualTimeSource::new(time)),
        )
    }

    fn request(target: &str) -> ConnectionRequest {
        ConnectionRequest {
            target_id: target.to_string(),
            template: 600,
            timeout_secs: 10,
            extension_info: String::new(),
        }
    }

    fn connected(ids: &[&str]) -> SessionEvent {
        SessionEvent::ConnectionChanged {
            connected: ids.iter().map(|id| Participant::new(*id, *id)).collect(),
        }
    }

    fn battle_started(round_id: &str, inviter: &str, invitees: &[&str], start: i64) -> SessionEvent {
        SessionEvent::BattleStarted {
            round_id: round_id.to_string(),
            inviter: Participant::new(inviter, inviter),
            invitees: invitees.iter().map(|id| Participant::new(*id, *id)).collect(),
            config: BattleConfig {
                duration_secs: 60,
                start_time_ms: start,
                extension_info: String::new(),
            },
        }
    }

    async fn wait_for_phase(sub: &mut Subscription, phase: BattlePhase) -> SessionSnapshot {
        let current = sub.current();
        if current.battle.phase == phase {
            return current;
        }
        loop {
            let snapshot = sub.changed().await.unwrap();
            if snapshot.battle.phase == phase {
                return snapshot;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_requests_issue_one_invite() {
        let signaling = RecordingSignaling::holding();
        let hub = make_hub(signaling.clone(), None);
        let session = hub.session("me");

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.request_connection(request("peer")).await }
        });
        while signaling.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = session.request_connection(request("peer")).await;
        assert_eq!(second, Err(CohostError::AlreadyPending("peer".into())));
        assert_eq!(signaling.calls(), vec!["invite:peer"]);

        signaling.complete_next(Ok(()));
        assert_eq!(first.await.unwrap(), Ok(()));
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.connection.pending_target.as_deref(), Some("peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_invite_surfaces_network_failure() {
        let signaling = RecordingSignaling::holding();
        let hub = make_hub(signaling.clone(), None);
        let session = hub.session("me");

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.request_connection(request("peer")).await }
        });
        while signaling.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        signaling.complete_next(Err(SignalingError {
            code: 7,
            message: "offline".into(),
        }));
        assert_eq!(
            pending.await.unwrap(),
            Err(CohostError::NetworkFailure {
                code: 7,
                message: "offline".into()
            })
        );
        let snapshot = session.snapshot().await.unwrap();
        assert!(snapshot.connection.pending_target.is_none());
        assert!(snapshot.connection.candidates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_gets_configured_default() {
        struct TimeoutRecorder(Mutex<Option<u32>>);
        impl CoHostSignaling for TimeoutRecorder {
            fn request_connection(&self, _: &str, request: &ConnectionRequest, done: Completion) {
                *self.0.lock().unwrap() = Some(request.timeout_secs);
                done(Ok(()));
            }
            fn cancel_connection(&self, _: &str, _: &str, done: Completion) {
                done(Ok(()));
            }
            fn accept_connection(&self, _: &str, _: &str, done: Completion) {
                done(Ok(()));
            }
            fn reject_connection(&self, _: &str, _: &str, done: Completion) {
                done(Ok(()));
            }
            fn disconnect(&self, _: &str, done: Completion) {
                done(Ok(()));
            }
        }

        let recorder = Arc::new(TimeoutRecorder(Mutex::new(None)));
        let hub = SessionHub::new(
            CohostConfig::default(),
            recorder.clone(),
            Arc::new(ManualTimeSource::new(None)),
        );
        let mut req = request("peer");
        req.timeout_secs = 0;
        hub.session("me").request_connection(req).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_pending_makes_no_call() {
        let signaling = RecordingSignaling::immediate();
        let hub = make_hub(signaling.clone(), None);
        let session = hub.session("me");

        assert_eq!(session.cancel_connection("peer").await, Ok(()));
        assert_eq!(session.cancel_connection("peer").await, Ok(()));
        assert!(signaling.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invite_then_cancel_reverts_candidate() {
        let signaling = RecordingSignaling::immediate();
        let hub = make_hub(signaling.clone(), None);
        let session = hub.session("me");
        session
            .dispatch(SessionEvent::RecommendedChanged {
                candidates: vec![Participant::new("peer", "Peer")],
            })
            .unwrap();

        session.request_connection(request("peer")).await.unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.connection.candidates[0].status, CandidateStatus::Inviting);

        session.cancel_connection("peer").await.unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.connection.candidates[0].status, CandidateStatus::None);
        assert_eq!(signaling.calls(), vec!["invite:peer", "cancel:peer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn accepting_an_incoming_request() {
        let signaling = RecordingSignaling::immediate();
        let hub = make_hub(signaling.clone(), None);
        let session = hub.session("me");

        assert!(matches!(
            session.accept_connection("other").await,
            Err(CohostError::InvalidState(_))
        ));

        session
            .dispatch(SessionEvent::RequestReceived {
                inviter: Participant::new("other", "Other"),
                extension_info: String::new(),
            })
            .unwrap();
        session.accept_connection("other").await.unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert!(snapshot.connection.incoming_request.is_none());
        assert_eq!(signaling.calls(), vec!["accept:other"]);
    }

    #[tokio::test(start_paused = true)]
    async fn battle_runs_through_announcement_and_counts_down() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("me");
        hub.dispatch("me", connected(&["me", "peer"])).unwrap();
        hub.dispatch("me", battle_started("r1", "me", &["peer"], START)).unwrap();

        let starting = wait_for_phase(&mut sub, BattlePhase::Starting).await;
        assert_eq!(starting.countdown_seconds, None);

        let running = wait_for_phase(&mut sub, BattlePhase::Running).await;
        assert_eq!(running.battle.round.unwrap().id, "r1");

        // No shared clock: elapsed time counts from the start event, so the
        // announcement delay is already spent.
        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(remaining) = sub.current().countdown_seconds {
                if seen.last() != Some(&remaining) {
                    seen.push(remaining);
                }
            }
            if seen.len() < 2 {
                sub.changed().await.unwrap();
            }
        }
        assert_eq!(seen, vec![57, 56]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_equal_scores_is_a_draw() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("A");
        hub.dispatch("A", connected(&["A", "B"])).unwrap();
        hub.dispatch("A", battle_started("r1", "A", &["B"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;

        for (id, score) in [("A", 5), ("B", 5)] {
            hub.dispatch(
                "A",
                SessionEvent::ScoreDelta {
                    round_id: "r1".into(),
                    participant_id: id.into(),
                    score,
                },
            )
            .unwrap();
        }

        let ended = wait_for_phase(&mut sub, BattlePhase::Ending(EndReason::TimeOver)).await;
        assert_eq!(ended.countdown_seconds, None);
        assert!(ended.ranking.is_final);
        assert_eq!(ended.ranking.outcome, Some(BattleOutcome::Draw));
        assert!(ended.ranking.entries.iter().all(|e| e.rank == 1 && e.score == 5));

        let idle = wait_for_phase(&mut sub, BattlePhase::Idle).await;
        assert!(idle.battle.round.is_none());
        assert!(idle.ranking.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_loss_emits_one_forced_end() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;

        let mut battle = sub.battle_receiver();
        battle.borrow_and_update();

        session.dispatch(connected(&["me"])).unwrap();
        battle.changed().await.unwrap();
        assert_eq!(
            battle.borrow_and_update().phase,
            BattlePhase::Ending(EndReason::InsufficientParticipants)
        );

        session.dispatch(connected(&["me"])).unwrap();
        session.dispatch(connected(&[])).unwrap();
        session
            .dispatch(SessionEvent::ScoreDelta {
                round_id: "r1".into(),
                participant_id: "me".into(),
                score: 3,
            })
            .unwrap();
        session.snapshot().await.unwrap();
        assert!(!battle.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn end_before_late_score_does_not_resurrect_round() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;

        session
            .dispatch(SessionEvent::BattleEnded {
                round_id: "r1".into(),
                reason: EndReason::AllMembersExited,
                final_scores: Some([("me".to_string(), 4), ("peer".to_string(), 2)].into()),
            })
            .unwrap();
        session
            .dispatch(SessionEvent::ScoreDelta {
                round_id: "r1".into(),
                participant_id: "peer".into(),
                score: 50,
            })
            .unwrap();

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Ending(EndReason::AllMembersExited));
        assert_eq!(snapshot.ranking.outcome, Some(BattleOutcome::Victory));
        let peer = snapshot
            .ranking
            .entries
            .iter()
            .find(|e| e.participant_id == "peer")
            .unwrap();
        assert_eq!(peer.score, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn end_delivered_before_start_keeps_round_closed() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer"])).unwrap();
        session
            .dispatch(SessionEvent::BattleEnded {
                round_id: "r1".into(),
                reason: EndReason::TimeOver,
                final_scores: None,
            })
            .unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Idle);
        assert!(snapshot.battle.round.is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Idle);
        assert_eq!(snapshot.countdown_seconds, None);

        session.dispatch(battle_started("r2", "me", &["peer"], START)).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn new_round_cuts_result_hold_short() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;
        session
            .dispatch(SessionEvent::BattleEnded {
                round_id: "r1".into(),
                reason: EndReason::TimeOver,
                final_scores: None,
            })
            .unwrap();

        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Ending(EndReason::TimeOver));

        session.dispatch(battle_started("r2", "peer", &["me"], START)).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.phase, BattlePhase::Starting);
        assert_eq!(snapshot.battle.round.unwrap().id, "r2");
        assert!(!snapshot.ranking.is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_ignored() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer", "third"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;

        session.dispatch(battle_started("r2", "third", &["me"], START)).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.battle.round.unwrap().id, "r1");
        assert_eq!(snapshot.battle.phase, BattlePhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_recomputes_countdown_from_shared_time() {
        let time = Arc::new(ManualTimeSource::new(Some(START)));
        let hub = SessionHub::new(
            CohostConfig::default(),
            RecordingSignaling::immediate(),
            time.clone(),
        );
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");
        session.dispatch(connected(&["me", "peer"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;

        // Suspended for 30 s: no ticks ran, the shared clock moved on.
        time.set(Some(START + 30_000));
        session.dispatch(SessionEvent::Resumed).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.countdown_seconds, Some(30));

        session.dispatch(SessionEvent::PipModeChanged { enabled: true }).unwrap();
        let snapshot = session.snapshot().await.unwrap();
        assert!(snapshot.battle.pip_mode);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_rejects_calls() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let session = hub.session("me");
        assert!(hub.close_session("me"));
        assert!(!hub.close_session("me"));

        tokio::task::yield_now().await;
        let err = session.request_connection(request("peer")).await.unwrap_err();
        assert_eq!(err, CohostError::SessionClosed("me".into()));
        assert!(hub.session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_mid_round_drops_pending_calls_and_countdown() {
        let signaling = RecordingSignaling::holding();
        let hub = make_hub(signaling.clone(), None);
        let mut sub = hub.subscribe("me");
        let session = hub.session("me");

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.request_connection(request("peer")).await }
        });
        while signaling.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        session.dispatch(connected(&["me", "peer"])).unwrap();
        session.dispatch(battle_started("r1", "me", &["peer"], START)).unwrap();
        wait_for_phase(&mut sub, BattlePhase::Running).await;
        while sub.current().countdown_seconds.is_none() {
            sub.changed().await.unwrap();
        }

        assert!(hub.close_session("me"));
        assert_eq!(
            pending.await.unwrap(),
            Err(CohostError::SessionClosed("me".into()))
        );
        let at_close = sub.current().countdown_seconds;
        assert!(at_close.is_some());

        // Settling the invite after teardown goes nowhere.
        drop(session);
        signaling.complete_next(Ok(()));
        tokio::time::sleep(Duration::from_secs(10)).await;

        while sub.changed().await.is_some() {}
        assert_eq!(sub.current().countdown_seconds, at_close);
        assert_eq!(sub.current().battle.phase, BattlePhase::Running);
        assert!(hub.session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_grace_expiry_spares_reattached_session() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        drop(hub.subscribe("me"));
        let session = hub.session("me");
        let mut sub = hub.subscribe("me");

        // Grace timer of the first observer firing after the second attached.
        assert!(!hub.inner.expire("me", 2));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(hub.session_ids(), vec!["me"]);
        assert_eq!(hub.observer_count("me"), 1);

        session.dispatch(SessionEvent::PipModeChanged { enabled: true }).unwrap();
        let snapshot = sub.changed().await.unwrap();
        assert!(snapshot.battle.pip_mode);
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn last_observer_leaving_tears_session_down() {
        let hub = make_hub(RecordingSignaling::immediate(), None);
        let sub = hub.subscribe("me");
        let session = hub.session("me");
        assert_eq!(hub.observer_count("me"), 1);

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(hub.session_ids().is_empty());
        assert!(session.snapshot().await.is_err());
    }
}
