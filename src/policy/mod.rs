//! Eligibility and scoring policy shared by the registry and the scheduler

pub mod eligibility;
pub mod scoring;

pub use eligibility::{DefaultEligibility, EligibilityPredicate};
pub use scoring::{ClientCountScore, ScoreFunction, ScoreTable, WILDCARD};

use std::fmt;
use std::sync::Arc;

use crate::record::RoomRecord;

/// Pluggable matchmaking policy
#[derive(Clone)]
pub struct MatchmakingPolicy {
    eligibility: Arc<dyn EligibilityPredicate>,
    scores: ScoreTable,
}

impl MatchmakingPolicy {
    pub fn new(eligibility: Arc<dyn EligibilityPredicate>, scores: ScoreTable) -> Self {
        Self {
            eligibility,
            scores,
        }
    }

    /// Replace the eligibility predicate
    pub fn with_eligibility(mut self, eligibility: impl EligibilityPredicate + 'static) -> Self {
        self.eligibility = Arc::new(eligibility);
        self
    }

    /// Use a score function for one room name (`"*"` for every other name)
    pub fn with_score_for(
        mut self,
        room_name: impl Into<String>,
        function: impl ScoreFunction + 'static,
    ) -> Self {
        self.scores.insert(room_name, Arc::new(function));
        self
    }

    pub fn with_default_score(self, function: impl ScoreFunction + 'static) -> Self {
        self.with_score_for(WILDCARD, function)
    }

    pub fn is_eligible(&self, room: &RoomRecord) -> bool {
        self.eligibility.is_eligible(room)
    }

    pub fn score_contribution(&self, room: &RoomRecord) -> f64 {
        self.scores.contribution(room)
    }

    /// Score change for a room moving from `before` to `after`
    pub fn score_delta(&self, before: Option<&RoomRecord>, after: Option<&RoomRecord>) -> f64 {
        let old = before.map(|r| self.score_contribution(r)).unwrap_or(0.0);
        let new = after.map(|r| self.score_contribution(r)).unwrap_or(0.0);
        new - old
    }
}

impl Default for MatchmakingPolicy {
    fn default() -> Self {
        Self::new(Arc::new(DefaultEligibility), ScoreTable::default())
    }
}

impl fmt::Debug for MatchmakingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchmakingPolicy")
            .field("scores", &self.scores)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_delta() {
        let policy = MatchmakingPolicy::default();
        let before = RoomRecord::new("arena", "p1").with_clients(2);
        let after = before.clone().with_clients(3);

        assert_eq!(policy.score_delta(Some(&before), Some(&after)), 1.0);
        assert_eq!(policy.score_delta(None, Some(&after)), 3.0);
        assert_eq!(policy.score_delta(Some(&after), None), -3.0);
    }

    #[test]
    fn test_overrides() {
        let policy = MatchmakingPolicy::default()
            .with_eligibility(|room: &RoomRecord| room.clients == 0)
            .with_default_score(|_: &RoomRecord| 5.0);

        let room = RoomRecord::new("arena", "p1");
        assert!(policy.is_eligible(&room));
        assert!(!policy.is_eligible(&room.clone().with_clients(1)));
        assert_eq!(policy.score_contribution(&room), 5.0);
    }
}
