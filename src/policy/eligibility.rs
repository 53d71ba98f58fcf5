//! Room eligibility predicates

use crate::record::RoomRecord;

/// Decides whether a room may receive matchmaking assignments
pub trait EligibilityPredicate: Send + Sync {
    fn is_eligible(&self, room: &RoomRecord) -> bool;
}

impl<F> EligibilityPredicate for F
where
    F: Fn(&RoomRecord) -> bool + Send + Sync,
{
    fn is_eligible(&self, room: &RoomRecord) -> bool {
        self(room)
    }
}

/// Unlocked, public, listed and not full
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEligibility;

impl EligibilityPredicate for DefaultEligibility {
    fn is_eligible(&self, room: &RoomRecord) -> bool {
        !room.locked && !room.private && !room.unlisted && room.has_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_eligibility() {
        let room = RoomRecord::new("arena", "p1").with_max_clients(4).with_clients(3);
        assert!(DefaultEligibility.is_eligible(&room));

        assert!(!DefaultEligibility.is_eligible(&room.clone().with_clients(4)));

        let mut locked = room.clone();
        locked.locked = true;
        assert!(!DefaultEligibility.is_eligible(&locked));

        let mut private = room.clone();
        private.private = true;
        assert!(!DefaultEligibility.is_eligible(&private));

        let mut unlisted = room;
        unlisted.unlisted = true;
        assert!(!DefaultEligibility.is_eligible(&unlisted));
    }

    #[test]
    fn test_closure_predicate() {
        let only_arena = |room: &RoomRecord| room.name == "arena";
        assert!(only_arena.is_eligible(&RoomRecord::new("arena", "p1")));
        assert!(!only_arena.is_eligible(&RoomRecord::new("lobby", "p1")));
    }
}
