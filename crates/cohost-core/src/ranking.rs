//! Tie-aware ranking of battle scores.
//!
//! Ranks follow the competition scheme: tied scores share a rank and the next
//! distinct score resumes at its 1-based position (1, 2, 2, 4).

use serde::{Deserialize, Serialize};

use crate::events::{BattleOutcome, ScoreMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub participant_id: String,
    pub score: u32,
    pub rank: u32,
}

/// Rank every participant of `scores`, best first.
///
/// Equal scores are ordered by participant id so the output is stable.
pub fn rank(scores: &ScoreMap) -> Vec<RankedEntry> {
    let mut sorted: Vec<(&String, u32)> = scores.iter().map(|(id, s)| (id, *s)).collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut ranked: Vec<RankedEntry> = Vec::with_capacity(sorted.len());
    for (position, (id, score)) in sorted.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(prev) if prev.score == score => prev.rank,
            _ => position as u32 + 1,
        };
        ranked.push(RankedEntry {
            participant_id: id.clone(),
            score,
            rank,
        });
    }
    ranked
}

/// Collapse a two-party ranking to an outcome seen from `self_id`.
///
/// Returns `None` unless there are exactly two entries and one of them is
/// `self_id`; multi-party battles are presented by rank only.
pub fn outcome_for(ranking: &[RankedEntry], self_id: &str) -> Option<BattleOutcome> {
    let [a, b] = ranking else {
        return None;
    };
    let (me, other) = if a.participant_id == self_id {
        (a, b)
    } else if b.participant_id == self_id {
        (b, a)
    } else {
        return None;
    };
    Some(match (me.rank, other.rank) {
        (1, 1) => BattleOutcome::Draw,
        (1, _) => BattleOutcome::Victory,
        _ => BattleOutcome::Defeat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(entries: &[(&str, u32)]) -> ScoreMap {
        entries.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn rank_of(ranking: &[RankedEntry], id: &str) -> u32 {
        ranking.iter().find(|e| e.participant_id == id).unwrap().rank
    }

    #[test]
    fn ties_share_rank_and_next_resumes_at_position() {
        let ranking = rank(&scores(&[("A", 10), ("B", 10), ("C", 5)]));
        assert_eq!(rank_of(&ranking, "A"), 1);
        assert_eq!(rank_of(&ranking, "B"), 1);
        assert_eq!(rank_of(&ranking, "C"), 3);
    }

    #[test]
    fn one_two_two_four() {
        let ranking = rank(&scores(&[("a", 40), ("b", 30), ("c", 30), ("d", 10)]));
        let ranks: Vec<u32> = ranking.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 2, 4]);
    }

    #[test]
    fn equal_scores_equal_rank_greater_score_better_rank() {
        let maps = [
            scores(&[("a", 3), ("b", 3), ("c", 3)]),
            scores(&[("a", 0), ("b", 7), ("c", 7), ("d", 1), ("e", 9)]),
            scores(&[("x", 100), ("y", 0)]),
            scores(&[("p", 5), ("q", 4), ("r", 5), ("s", 4), ("t", 4), ("u", 2)]),
        ];
        for map in &maps {
            let ranking = rank(map);
            assert_eq!(ranking.len(), map.len());
            for a in &ranking {
                for b in &ranking {
                    if a.score == b.score {
                        assert_eq!(a.rank, b.rank);
                    } else if a.score > b.score {
                        assert!(a.rank < b.rank, "{a:?} vs {b:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn empty_scores_rank_empty() {
        assert!(rank(&ScoreMap::new()).is_empty());
    }

    #[test]
    fn ties_are_ordered_by_id() {
        let ranking = rank(&scores(&[("b", 1), ("a", 1)]));
        assert_eq!(ranking[0].participant_id, "a");
        assert_eq!(ranking[1].participant_id, "b");
    }

    #[test]
    fn two_party_outcomes() {
        let win = rank(&scores(&[("me", 9), ("them", 3)]));
        assert_eq!(outcome_for(&win, "me"), Some(BattleOutcome::Victory));
        assert_eq!(outcome_for(&win, "them"), Some(BattleOutcome::Defeat));

        let draw = rank(&scores(&[("me", 5), ("them", 5)]));
        assert_eq!(outcome_for(&draw, "me"), Some(BattleOutcome::Draw));
        assert_eq!(outcome_for(&draw, "them"), Some(BattleOutcome::Draw));
    }

    #[test]
    fn no_outcome_outside_two_party_battles() {
        let three = rank(&scores(&[("me", 9), ("b", 9), ("c", 1)]));
        assert_eq!(outcome_for(&three, "me"), None);

        let two = rank(&scores(&[("a", 1), ("b", 2)]));
        assert_eq!(outcome_for(&two, "me"), None);
    }
}
