//! Room query conditions

use std::collections::BTreeMap;

use crate::policy::MatchmakingPolicy;
use crate::record::schema::{FieldValue, ELIGIBLE_FIELD};
use crate::record::RoomRecord;

/// Condition on one field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(FieldValue),
    /// Inclusive numeric range
    Range { min: f64, max: f64 },
}

impl Condition {
    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        match (self, value) {
            (Condition::Eq(expected), Some(actual)) => expected == actual,
            // an absent boolean reads as false
            (Condition::Eq(FieldValue::Boolean(false)), None) => true,
            (Condition::Range { min, max }, Some(FieldValue::Number(n))) => *n >= *min && *n <= *max,
            _ => false,
        }
    }
}

/// Conjunction of field conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomQuery {
    conditions: BTreeMap<String, Condition>,
}

impl RoomQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rooms currently eligible for matchmaking
    pub fn eligible() -> Self {
        Self::new().eq(ELIGIBLE_FIELD, true)
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.conditions
            .insert(field.into(), Condition::Eq(value.into()));
        self
    }

    pub fn range(mut self, field: impl Into<String>, min: f64, max: f64) -> Self {
        self.conditions
            .insert(field.into(), Condition::Range { min, max });
        self
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.conditions.iter()
    }

    pub fn get(&self, field: &str) -> Option<&Condition> {
        self.conditions.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate every condition against a record in memory
    pub fn matches(&self, room: &RoomRecord, policy: &MatchmakingPolicy) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            if field == ELIGIBLE_FIELD {
                condition.matches(Some(&FieldValue::Boolean(policy.is_eligible(room))))
            } else {
                condition.matches(room.field(field).as_ref())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_matching() {
        let policy = MatchmakingPolicy::default();
        let room = RoomRecord::new("arena", "p1")
            .with_clients(2)
            .with_max_clients(4)
            .with_metadata("mode", "ranked");

        assert!(RoomQuery::eligible().eq("name", "arena").matches(&room, &policy));
        assert!(RoomQuery::new().eq("mode", "ranked").matches(&room, &policy));
        assert!(!RoomQuery::new().eq("mode", "casual").matches(&room, &policy));
        assert!(RoomQuery::new().range("clients", 1.0, 3.0).matches(&room, &policy));
        assert!(!RoomQuery::new().range("clients", 3.0, 4.0).matches(&room, &policy));
        assert!(RoomQuery::new().eq("locked", false).matches(&room, &policy));
        assert!(RoomQuery::new().eq("missingFlag", false).matches(&room, &policy));
    }
}
