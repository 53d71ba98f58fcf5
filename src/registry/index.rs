//! Secondary index planning
//!
//! Turns a record transition (previous snapshot → new snapshot) into the
//! ordered write ops that keep every index in step with the primary body.
//!
//! Per field type: boolean → flag set (member iff true); string → one
//! membership set per value; number → a sorted set plus one membership set
//! per value; json → nothing.

use crate::error::Result;
use crate::policy::MatchmakingPolicy;
use crate::record::schema::{FieldType, FieldValue, MetadataSchema, ELIGIBLE_FIELD};
use crate::record::RoomRecord;
use crate::registry::keys::KeyLayout;
use crate::store::WriteOp;

/// Index-relevant value of a field, with eligibility derived from the policy
fn indexed_value(
    room: &RoomRecord,
    field: &str,
    field_type: FieldType,
    policy: &MatchmakingPolicy,
) -> Option<FieldValue> {
    let value = if field == ELIGIBLE_FIELD {
        Some(FieldValue::Boolean(policy.is_eligible(room)))
    } else {
        room.field(field)
    };

    // values that do not match the declared type are not indexed
    match (field_type, value) {
        (FieldType::Boolean, Some(v @ FieldValue::Boolean(_)))
        | (FieldType::String, Some(v @ FieldValue::String(_)))
        | (FieldType::Number, Some(v @ FieldValue::Number(_))) => Some(v),
        _ => None,
    }
}

fn remove_entry(keys: &KeyLayout, field: &str, value: &FieldValue, id: &str) -> Vec<WriteOp> {
    let member = id.to_string();
    match value {
        FieldValue::Boolean(true) => vec![WriteOp::SetRem {
            key: keys.field(field),
            member,
        }],
        FieldValue::Boolean(false) | FieldValue::Json(_) => Vec::new(),
        FieldValue::String(s) => vec![WriteOp::SetRem {
            key: keys.field_value(field, s),
            member,
        }],
        FieldValue::Number(_) => {
            let token = value.index_token().unwrap_or_default();
            vec![
                WriteOp::SortedRem {
                    key: keys.field(field),
                    member: member.clone(),
                },
                WriteOp::SetRem {
                    key: keys.field_value(field, &token),
                    member,
                },
            ]
        }
    }
}

fn add_entry(keys: &KeyLayout, field: &str, value: &FieldValue, id: &str) -> Vec<WriteOp> {
    let member = id.to_string();
    match value {
        FieldValue::Boolean(true) => vec![WriteOp::SetAdd {
            key: keys.field(field),
            member,
        }],
        FieldValue::Boolean(false) | FieldValue::Json(_) => Vec::new(),
        FieldValue::String(s) => vec![WriteOp::SetAdd {
            key: keys.field_value(field, s),
            member,
        }],
        FieldValue::Number(n) => {
            let token = value.index_token().unwrap_or_default();
            vec![
                WriteOp::SortedAdd {
                    key: keys.field(field),
                    member: member.clone(),
                    score: *n,
                },
                WriteOp::SetAdd {
                    key: keys.field_value(field, &token),
                    member,
                },
            ]
        }
    }
}

/// Plan the writes for storing `new` over `old`
///
/// Only fields whose indexed value changed produce index ops. The body,
/// id-set membership and score delta are always included.
pub fn plan_room_write(
    keys: &KeyLayout,
    schema: &MetadataSchema,
    policy: &MatchmakingPolicy,
    old: Option<&RoomRecord>,
    new: &RoomRecord,
) -> Result<Vec<WriteOp>> {
    let id = new.room_id.as_str();
    let mut ops = Vec::new();

    for entry in schema.indexed_fields() {
        let field = entry.field.as_str();
        let before = old.and_then(|o| indexed_value(o, field, entry.field_type, policy));
        let after = indexed_value(new, field, entry.field_type, policy);

        if old.is_some() && before == after {
            continue;
        }
        if let Some(before) = &before {
            ops.extend(remove_entry(keys, field, before, id));
        }
        if let Some(after) = &after {
            ops.extend(add_entry(keys, field, after, id));
        }
    }

    ops.push(WriteOp::HashSet {
        hash: keys.rooms().to_string(),
        id: id.to_string(),
        value: new.encode()?,
    });
    if old.is_none() {
        ops.push(WriteOp::SetAdd {
            key: keys.room_ids(),
            member: id.to_string(),
        });
    }

    ops.extend(score_ops(keys, policy, old, Some(new)));
    Ok(ops)
}

/// Plan the writes that erase `old` and every index entry it owns
pub fn plan_room_remove(
    keys: &KeyLayout,
    schema: &MetadataSchema,
    policy: &MatchmakingPolicy,
    old: &RoomRecord,
) -> Vec<WriteOp> {
    let id = old.room_id.as_str();
    let mut ops = Vec::new();

    for entry in schema.indexed_fields() {
        if let Some(value) = indexed_value(old, &entry.field, entry.field_type, policy) {
            ops.extend(remove_entry(keys, &entry.field, &value, id));
        }
    }

    ops.push(WriteOp::HashDel {
        hash: keys.rooms().to_string(),
        id: id.to_string(),
    });
    ops.push(WriteOp::SetRem {
        key: keys.room_ids(),
        member: id.to_string(),
    });

    ops.extend(score_ops(keys, policy, Some(old), None));
    ops
}

/// Score deltas for a room moving between snapshots, possibly across processes
fn score_ops(
    keys: &KeyLayout,
    policy: &MatchmakingPolicy,
    old: Option<&RoomRecord>,
    new: Option<&RoomRecord>,
) -> Vec<WriteOp> {
    let incr = |process_id: &str, delta: f64| WriteOp::SortedIncr {
        key: keys.process_scores(),
        member: process_id.to_string(),
        delta,
    };

    match (old, new) {
        (Some(o), Some(n)) if o.process_id != n.process_id => {
            let mut ops = Vec::new();
            let released = policy.score_contribution(o);
            let gained = policy.score_contribution(n);
            if released != 0.0 {
                ops.push(incr(&o.process_id, -released));
            }
            if gained != 0.0 {
                ops.push(incr(&n.process_id, gained));
            }
            ops
        }
        _ => {
            let delta = policy.score_delta(old, new);
            let owner = new.or(old).map(|r| r.process_id.as_str());
            match owner {
                Some(process_id) if delta != 0.0 => vec![incr(process_id, delta)],
                _ => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (KeyLayout, MetadataSchema, MatchmakingPolicy) {
        (
            KeyLayout::new("rc"),
            MetadataSchema::room_defaults().with_field("mode", FieldType::String),
            MatchmakingPolicy::default(),
        )
    }

    fn has(ops: &[WriteOp], op: &WriteOp) -> bool {
        ops.iter().any(|o| o == op)
    }

    #[test]
    fn test_create_indexes_every_field() {
        let (keys, schema, policy) = setup();
        let room = RoomRecord::new("arena", "p1")
            .with_room_id("r1")
            .with_clients(2)
            .with_max_clients(4)
            .with_metadata("mode", "ranked");

        let ops = plan_room_write(&keys, &schema, &policy, None, &room).unwrap();

        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:field:name:arena".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:field:mode:ranked".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SortedAdd {
            key: "rc:field:clients".into(),
            member: "r1".into(),
            score: 2.0
        }));
        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:field:clients:2".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:field:eligibleForMatchmaking".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:ids".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SortedIncr {
            key: "rc:processes:score".into(),
            member: "p1".into(),
            delta: 2.0
        }));
        // false flags and roomId are never indexed
        assert!(!ops.iter().any(|o| o.key() == "rc:field:locked"));
        assert!(!ops.iter().any(|o| o.key().starts_with("rc:field:roomId")));
    }

    #[test]
    fn test_changed_field_moves_index_entry() {
        let (keys, schema, policy) = setup();
        let old = RoomRecord::new("arena", "p1")
            .with_room_id("r1")
            .with_metadata("mode", "ranked");
        let new = old.clone().with_metadata("mode", "casual");

        let ops = plan_room_write(&keys, &schema, &policy, Some(&old), &new).unwrap();

        assert!(has(&ops, &WriteOp::SetRem {
            key: "rc:field:mode:ranked".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SetAdd {
            key: "rc:field:mode:casual".into(),
            member: "r1".into()
        }));
        // unchanged fields are left alone
        assert!(!ops.iter().any(|o| o.key().starts_with("rc:field:name")));
        assert!(!ops.iter().any(|o| o.key() == "rc:ids"));
    }

    #[test]
    fn test_filling_room_drops_eligibility() {
        let (keys, schema, policy) = setup();
        let old = RoomRecord::new("arena", "p1")
            .with_room_id("r1")
            .with_clients(3)
            .with_max_clients(4);
        let new = old.clone().with_clients(4);

        let ops = plan_room_write(&keys, &schema, &policy, Some(&old), &new).unwrap();
        assert!(has(&ops, &WriteOp::SetRem {
            key: "rc:field:eligibleForMatchmaking".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SortedIncr {
            key: "rc:processes:score".into(),
            member: "p1".into(),
            delta: 1.0
        }));
    }

    #[test]
    fn test_remove_erases_entries_and_score() {
        let (keys, schema, policy) = setup();
        let room = RoomRecord::new("arena", "p1")
            .with_room_id("r1")
            .with_clients(3)
            .with_metadata("mode", "ranked");

        let ops = plan_room_remove(&keys, &schema, &policy, &room);
        assert!(has(&ops, &WriteOp::SetRem {
            key: "rc:field:mode:ranked".into(),
            member: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::HashDel {
            hash: "rc".into(),
            id: "r1".into()
        }));
        assert!(has(&ops, &WriteOp::SortedIncr {
            key: "rc:processes:score".into(),
            member: "p1".into(),
            delta: -3.0
        }));
    }

    #[test]
    fn test_moving_process_transfers_score() {
        let (keys, schema, policy) = setup();
        let old = RoomRecord::new("arena", "p1").with_room_id("r1").with_clients(2);
        let mut new = old.clone();
        new.process_id = "p2".to_string();

        let ops = plan_room_write(&keys, &schema, &policy, Some(&old), &new).unwrap();
        assert!(has(&ops, &WriteOp::SortedIncr {
            key: "rc:processes:score".into(),
            member: "p1".into(),
            delta: -2.0
        }));
        assert!(has(&ops, &WriteOp::SortedIncr {
            key: "rc:processes:score".into(),
            member: "p2".into(),
            delta: 2.0
        }));
    }
}
