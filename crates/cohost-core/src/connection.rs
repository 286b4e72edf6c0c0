use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{CohostError, SignalingError};
use crate::events::{CandidateStatus, ConnectionCandidate, ConnectionRequest, Participant};

/// Connection slice published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub connected: Vec<Participant>,
    pub candidates: Vec<ConnectionCandidate>,
    /// Target of the outstanding local invitation.
    pub pending_target: Option<String>,
    /// Invitation received from another session and not answered yet.
    pub incoming_request: Option<Participant>,
}

#[derive(Debug, Clone)]
struct PendingInvite {
    request_id: Uuid,
    target_id: String,
}

/// Tracks co-host candidates, the outstanding invite and connected sessions
/// for one live session.
///
/// Owned by the session event loop. Network calls are issued by the caller;
/// the registry only decides whether a call may go out and records the result.
#[derive(Debug)]
pub struct ConnectionRegistry {
    self_id: String,
    max_seats: usize,
    debounce: Duration,
    connected: Vec<Participant>,
    candidates: Vec<ConnectionCandidate>,
    recommended_ids: HashSet<String>,
    pending: Option<PendingInvite>,
    last_request_at: Option<Instant>,
    /// Targets with a cancellation still in flight.
    cancelling: HashSet<String>,
    incoming: Option<Participant>,
    answering: Option<String>,
    exiting: bool,
}

impl ConnectionRegistry {
    pub fn new(self_id: impl Into<String>, max_seats: usize, debounce: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            max_seats,
            debounce,
            connected: Vec::new(),
            candidates: Vec::new(),
            recommended_ids: HashSet::new(),
            pending: None,
            last_request_at: None,
            cancelling: HashSet::new(),
            incoming: None,
            answering: None,
            exiting: false,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn connected(&self) -> &[Participant] {
        &self.connected
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connected.iter().any(|p| p.id == id)
    }

    /// Connected sessions other than our own.
    pub fn remote_count(&self) -> usize {
        self.connected.iter().filter(|p| p.id != self.self_id).count()
    }

    pub fn candidate(&self, id: &str) -> Option<&ConnectionCandidate> {
        self.candidates.iter().find(|c| c.participant.id == id)
    }

    pub fn pending_target(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.target_id.as_str())
    }

    /// Validate and record an outgoing invitation.
    ///
    /// On success the caller must issue exactly one network request tagged
    /// with the returned id. Rejections never reach the network.
    pub fn begin_request(
        &mut self,
        request: &ConnectionRequest,
        now: Instant,
    ) -> Result<Uuid, CohostError> {
        let target = request.target_id.as_str();
        if target == self.self_id {
            return Err(CohostError::InvalidState("cannot invite own session".into()));
        }
        if self.is_connected(target) {
            return Err(CohostError::InvalidState(format!("{target} already connected")));
        }
        if let Some(pending) = &self.pending {
            return Err(CohostError::AlreadyPending(pending.target_id.clone()));
        }
        if self.cancelling.contains(target) {
            return Err(CohostError::AlreadyPending(target.to_string()));
        }
        if let Some(last) = self.last_request_at {
            if now.saturating_duration_since(last) < self.debounce {
                return Err(CohostError::AlreadyPending(target.to_string()));
            }
        }
        if self.remote_count() >= self.max_seats {
            return Err(CohostError::SeatsFull);
        }

        let request_id = Uuid::new_v4();
        match self.candidates.iter_mut().find(|c| c.participant.id == target) {
            Some(c) => c.status = CandidateStatus::Inviting,
            None => self.candidates.push(ConnectionCandidate {
                participant: Participant::new(target, ""),
                status: CandidateStatus::Inviting,
            }),
        }
        self.pending = Some(PendingInvite {
            request_id,
            target_id: target.to_string(),
        });
        self.last_request_at = Some(now);
        Ok(request_id)
    }

    /// Record the signaling completion of an invitation.
    ///
    /// Success means the invitation was delivered; it stays pending until
    /// the target answers. Completions for a superseded request are ignored.
    /// Returns true if the published view changed.
    pub fn settle_request(&mut self, request_id: Uuid, result: &Result<(), SignalingError>) -> bool {
        let Some(pending) = &self.pending else {
            tracing::debug!("stale invite completion {request_id}");
            return false;
        };
        if pending.request_id != request_id {
            tracing::debug!("stale invite completion {request_id}");
            return false;
        }
        match result {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!("invite to {} failed: {e}", pending.target_id);
                let target = pending.target_id.clone();
                self.pending = None;
                self.revert(&target);
                true
            }
        }
    }

    /// Withdraw the invitation to `target_id`.
    ///
    /// Returns false when nothing is pending for that target, in which case
    /// no network call must be made.
    pub fn cancel_request(&mut self, target_id: &str) -> bool {
        match &self.pending {
            Some(p) if p.target_id == target_id => {
                self.pending = None;
                self.revert(target_id);
                self.cancelling.insert(target_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn finish_cancel(&mut self, target_id: &str) {
        self.cancelling.remove(target_id);
    }

    pub fn on_request_accepted(&mut self, target_id: &str) -> bool {
        match &self.pending {
            Some(p) if p.target_id == target_id => {
                // Candidate stays Inviting until the connected set lists it.
                self.pending = None;
                true
            }
            _ => {
                tracing::debug!("accept from {target_id} without pending invite");
                false
            }
        }
    }

    /// Target rejected or let the invitation time out.
    pub fn on_request_declined(&mut self, target_id: &str) -> bool {
        match &self.pending {
            Some(p) if p.target_id == target_id => {
                self.pending = None;
                self.revert(target_id);
                true
            }
            _ => {
                tracing::debug!("decline from {target_id} without pending invite");
                false
            }
        }
    }

    /// Replace the connected set.
    pub fn on_connected_set_changed(&mut self, connected: Vec<Participant>) -> bool {
        if connected == self.connected {
            return false;
        }
        self.connected = connected;

        if let Some(p) = &self.pending {
            if self.is_connected(&p.target_id) {
                self.pending = None;
            }
        }
        if let Some(inviter) = &self.incoming {
            if self.is_connected(&inviter.id) {
                self.incoming = None;
            }
        }

        let mut dropped = Vec::new();
        for c in &mut self.candidates {
            let linked = self.connected.iter().any(|p| p.id == c.participant.id);
            match (c.status, linked) {
                (CandidateStatus::Inviting, true) => c.status = CandidateStatus::Connected,
                (CandidateStatus::Connected, false) => dropped.push(c.participant.id.clone()),
                _ => {}
            }
        }
        for id in dropped {
            self.revert(&id);
        }
        true
    }

    /// Replace the co-host recommendation list, keeping live candidates.
    pub fn set_recommended(&mut self, list: Vec<Participant>) -> bool {
        let before = self.candidates.clone();
        self.recommended_ids = list.iter().map(|p| p.id.clone()).collect();

        let mut next: Vec<ConnectionCandidate> = self
            .candidates
            .drain(..)
            .filter(|c| c.status != CandidateStatus::None)
            .collect();
        for p in list {
            match next.iter_mut().find(|c| c.participant.id == p.id) {
                Some(live) => live.participant = p,
                None => next.push(ConnectionCandidate {
                    participant: p,
                    status: CandidateStatus::None,
                }),
            }
        }
        self.candidates = next;
        self.candidates != before
    }

    pub fn on_request_received(&mut self, inviter: Participant) -> bool {
        if self.is_connected(&inviter.id) {
            tracing::debug!("request from already connected {}", inviter.id);
            return false;
        }
        if self.incoming.as_ref() == Some(&inviter) {
            return false;
        }
        self.incoming = Some(inviter);
        true
    }

    pub fn on_request_cancelled(&mut self, inviter_id: &str) -> bool {
        match &self.incoming {
            Some(p) if p.id == inviter_id => {
                self.incoming = None;
                true
            }
            _ => false,
        }
    }

    /// Check that an incoming request from `inviter_id` may be answered.
    pub fn begin_answer(&mut self, inviter_id: &str) -> Result<(), CohostError> {
        match &self.incoming {
            Some(p) if p.id == inviter_id => {}
            _ => {
                return Err(CohostError::InvalidState(format!(
                    "no request from {inviter_id}"
                )));
            }
        }
        if self.answering.is_some() {
            return Err(CohostError::AlreadyPending(inviter_id.to_string()));
        }
        self.answering = Some(inviter_id.to_string());
        Ok(())
    }

    /// Record the completion of an accept/reject. A failed answer keeps the
    /// request open so it can be answered again.
    pub fn settle_answer(&mut self, inviter_id: &str, result: &Result<(), SignalingError>) -> bool {
        if self.answering.as_deref() == Some(inviter_id) {
            self.answering = None;
        }
        if result.is_err() {
            return false;
        }
        self.on_request_cancelled(inviter_id)
    }

    /// Check whether leaving all co-host links needs a network call.
    ///
    /// Returns Ok(false) when there is nothing to leave.
    pub fn begin_exit(&mut self) -> Result<bool, CohostError> {
        if self.exiting {
            return Err(CohostError::AlreadyPending(self.self_id.clone()));
        }
        if self.remote_count() == 0 {
            return Ok(false);
        }
        self.exiting = true;
        Ok(true)
    }

    pub fn settle_exit(&mut self, result: &Result<(), SignalingError>) -> bool {
        self.exiting = false;
        if result.is_err() {
            return false;
        }
        let own: Vec<Participant> = self
            .connected
            .iter()
            .filter(|p| p.id == self.self_id)
            .cloned()
            .collect();
        self.on_connected_set_changed(own)
    }

    /// Drop every link and candidate (session end).
    pub fn clear(&mut self) {
        self.connected.clear();
        self.candidates.clear();
        self.recommended_ids.clear();
        self.pending = None;
        self.cancelling.clear();
        self.incoming = None;
        self.answering = None;
        self.exiting = false;
    }

    pub fn view(&self) -> ConnectionView {
        ConnectionView {
            connected: self.connected.clone(),
            candidates: self.candidates.clone(),
            pending_target: self.pending.as_ref().map(|p| p.target_id.clone()),
            incoming_request: self.incoming.clone(),
        }
    }

    fn revert(&mut self, id: &str) {
        if self.recommended_ids.contains(id) {
            if let Some(c) = self.candidates.iter_mut().find(|c| c.participant.id == id) {
                c.status = CandidateStatus::None;
            }
        } else {
            self.candidates.retain(|c| c.participant.id != id);
        }
    }
}
