use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::clock::RoundTiming;
use crate::errors::CohostError;
use crate::events::{EndReason, ScoreMap};
use crate::ranking::{self, RankedEntry};

/// Ended round ids remembered to reject late duplicate starts.
const ENDED_ROUND_MEMORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BattlePhase {
    Idle,
    Starting,
    Running,
    /// Result display hold before going back to Idle.
    Ending(EndReason),
}

impl BattlePhase {
    /// Starting or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleRound {
    pub id: String,
    pub participant_ids: BTreeSet<String>,
    pub timing: RoundTiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub id: String,
    pub participant_ids: Vec<String>,
    pub start_time_ms: i64,
    pub duration_secs: u32,
}

/// Battle slice published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleView {
    pub phase: BattlePhase,
    pub round: Option<RoundInfo>,
    pub pip_mode: bool,
}

impl Default for BattleView {
    fn default() -> Self {
        Self {
            phase: BattlePhase::Idle,
            round: None,
            pip_mode: false,
        }
    }
}

/// Round state machine of one session: Idle → Starting → Running →
/// Ending → Idle.
///
/// Out-of-order deliveries are logged and ignored; nothing here fails hard
/// except `start` on a busy session.
#[derive(Debug)]
pub struct BattleSession {
    phase: BattlePhase,
    round: Option<BattleRound>,
    scores: ScoreMap,
    ended_rounds: VecDeque<String>,
}

impl BattleSession {
    pub fn new() -> Self {
        Self {
            phase: BattlePhase::Idle,
            round: None,
            scores: ScoreMap::new(),
            ended_rounds: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> BattlePhase {
        self.phase
    }

    pub fn round(&self) -> Option<&BattleRound> {
        self.round.as_ref()
    }

    pub fn scores(&self) -> &ScoreMap {
        &self.scores
    }

    pub fn is_current(&self, round_id: &str) -> bool {
        self.round.as_ref().is_some_and(|r| r.id == round_id)
    }

    pub fn has_ended(&self, round_id: &str) -> bool {
        self.ended_rounds.iter().any(|id| id == round_id)
    }

    /// Open a new round. Valid only from Idle.
    pub fn start(&mut self, round: BattleRound) -> Result<(), CohostError> {
        if self.phase != BattlePhase::Idle {
            let current = self.round.as_ref().map(|r| r.id.clone()).unwrap_or_default();
            return Err(CohostError::RoundAlreadyActive(current));
        }
        if self.has_ended(&round.id) {
            return Err(CohostError::InvalidState(format!("round {} already ended", round.id)));
        }
        if round.participant_ids.len() < 2 {
            return Err(CohostError::InvalidState(format!(
                "round {} needs at least two participants",
                round.id
            )));
        }
        tracing::info!(
            "battle round {} starting with {} participants",
            round.id,
            round.participant_ids.len()
        );
        self.scores = round.participant_ids.iter().map(|id| (id.clone(), 0)).collect();
        self.round = Some(round);
        self.phase = BattlePhase::Starting;
        Ok(())
    }

    /// Starting → Running once the announcement delay has elapsed.
    pub fn begin_running(&mut self, round_id: &str) -> bool {
        if self.phase != BattlePhase::Starting || !self.is_current(round_id) {
            tracing::debug!("stale announcement for round {round_id}");
            return false;
        }
        self.phase = BattlePhase::Running;
        true
    }

    /// Record the new absolute score of one participant.
    pub fn apply_score_delta(&mut self, participant_id: &str, new_score: u32) -> bool {
        if self.phase != BattlePhase::Running {
            tracing::debug!("score for {participant_id} ignored in {:?}", self.phase);
            return false;
        }
        let Some(current) = self.scores.get_mut(participant_id) else {
            tracing::debug!("score for {participant_id} ignored, not in round");
            return false;
        };
        if new_score < *current {
            tracing::warn!("score for {participant_id} would decrease {} -> {new_score}", *current);
            return false;
        }
        if new_score == *current {
            return false;
        }
        *current = new_score;
        true
    }

    /// Replace the whole score map. Round participants missing from the
    /// snapshot read 0; ids outside the round are dropped.
    pub fn record_score_snapshot(&mut self, snapshot: &ScoreMap) -> bool {
        if !self.phase.is_active() {
            tracing::debug!("score snapshot ignored in {:?}", self.phase);
            return false;
        }
        let Some(round) = &self.round else {
            return false;
        };
        let next: ScoreMap = round
            .participant_ids
            .iter()
            .map(|id| (id.clone(), snapshot.get(id).copied().unwrap_or(0)))
            .collect();
        if next == self.scores {
            return false;
        }
        self.scores = next;
        true
    }

    /// Starting/Running → Ending. Returns false if no round is active.
    pub fn end(&mut self, reason: EndReason) -> bool {
        if !self.phase.is_active() {
            tracing::debug!("end({reason:?}) ignored in {:?}", self.phase);
            return false;
        }
        if let Some(round_id) = self.round.as_ref().map(|r| r.id.clone()) {
            tracing::info!("battle round {round_id} ending: {reason:?}");
            self.mark_ended(&round_id);
        }
        self.phase = BattlePhase::Ending(reason);
        true
    }

    /// Remember `round_id` as finished so a start delivered after its end
    /// is rejected.
    pub fn mark_ended(&mut self, round_id: &str) {
        if self.has_ended(round_id) {
            return;
        }
        self.ended_rounds.push_back(round_id.to_string());
        if self.ended_rounds.len() > ENDED_ROUND_MEMORY {
            self.ended_rounds.pop_front();
        }
    }

    /// Ending → Idle after the display hold.
    pub fn finish_ending(&mut self, round_id: &str) -> bool {
        if !matches!(self.phase, BattlePhase::Ending(_)) || !self.is_current(round_id) {
            return false;
        }
        self.phase = BattlePhase::Idle;
        self.round = None;
        self.scores.clear();
        true
    }

    /// Number of round participants present in `connected_ids`.
    pub fn connected_in_round<'a>(&self, connected_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let Some(round) = &self.round else {
            return 0;
        };
        connected_ids
            .into_iter()
            .filter(|id| round.participant_ids.contains(*id))
            .count()
    }

    /// Force-end an active round that lost its quorum. Fires at most once
    /// per round since an ended round is no longer active.
    pub fn enforce_quorum(&mut self, connected_in_round: usize) -> bool {
        if self.phase.is_active() && connected_in_round <= 1 {
            return self.end(EndReason::InsufficientParticipants);
        }
        false
    }

    pub fn ranking(&self) -> Vec<RankedEntry> {
        ranking::rank(&self.scores)
    }

    pub fn view(&self) -> BattleView {
        BattleView {
            phase: self.phase,
            round: self.round.as_ref().map(|r| RoundInfo {
                id: r.id.clone(),
                participant_ids: r.participant_ids.iter().cloned().collect(),
                start_time_ms: r.timing.start_time_ms,
                duration_secs: r.timing.duration_secs,
            }),
            pip_mode: false,
        }
    }
}

impl Default for BattleSession {
    fn default() -> Self {
        Self::new()
    }
}
