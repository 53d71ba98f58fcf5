//! Mutable working set for one tick
//!
//! Holds owned copies of the rooms and processes read at the start of a
//! tick. Joins and creates mutate these copies so later requests in the same
//! tick see earlier assignments. Dropped at the end of the tick.

use std::collections::HashMap;

use crate::error::{MatchmakingError, Result};
use crate::policy::MatchmakingPolicy;
use crate::record::schema::FieldValue;
use crate::record::{ProcessRecord, RoomRecord};
use crate::types::{ClientOptions, ProcessId, RoomId};

#[derive(Debug, Clone, Default)]
pub struct TickSnapshot {
    rooms: Vec<RoomRecord>,
    room_index: HashMap<RoomId, usize>,
    processes: Vec<ProcessRecord>,
    process_index: HashMap<ProcessId, usize>,
    rooms_per_process: HashMap<ProcessId, usize>,
    synthesized: usize,
}

impl TickSnapshot {
    /// `rooms` keep their given order; `processes` are expected least loaded first
    pub fn new(rooms: Vec<RoomRecord>, processes: Vec<ProcessRecord>) -> Self {
        let mut snapshot = Self::default();
        for room in rooms {
            snapshot.insert_room(room);
        }
        for process in processes {
            snapshot.insert_process(process);
        }
        snapshot
    }

    pub fn rooms(&self) -> &[RoomRecord] {
        &self.rooms
    }

    pub fn processes(&self) -> &[ProcessRecord] {
        &self.processes
    }

    pub fn room(&self, room_id: &str) -> Option<&RoomRecord> {
        self.room_index.get(room_id).map(|&i| &self.rooms[i])
    }

    pub fn process(&self, process_id: &str) -> Option<&ProcessRecord> {
        self.process_index.get(process_id).map(|&i| &self.processes[i])
    }

    /// Rooms placed by `create` during this tick
    pub fn synthesized_rooms(&self) -> usize {
        self.synthesized
    }

    pub fn rooms_on(&self, process_id: &str) -> usize {
        self.rooms_per_process.get(process_id).copied().unwrap_or(0)
    }

    /// Add or replace a room, e.g. one fetched from the registry mid-tick
    pub fn insert_room(&mut self, room: RoomRecord) {
        match self.room_index.get(&room.room_id) {
            Some(&i) => self.rooms[i] = room,
            None => {
                *self
                    .rooms_per_process
                    .entry(room.process_id.clone())
                    .or_insert(0) += 1;
                self.room_index.insert(room.room_id.clone(), self.rooms.len());
                self.rooms.push(room);
            }
        }
    }

    pub fn insert_process(&mut self, process: ProcessRecord) {
        match self.process_index.get(&process.process_id) {
            Some(&i) => self.processes[i] = process,
            None => {
                self.process_index
                    .insert(process.process_id.clone(), self.processes.len());
                self.processes.push(process);
            }
        }
    }

    /// First room of `name` with spare capacity whose metadata matches every
    /// `filter_by` field present in the client options
    pub fn find_joinable(
        &self,
        name: &str,
        filter_by: &[String],
        options: &ClientOptions,
        policy: &MatchmakingPolicy,
    ) -> Option<&RoomRecord> {
        self.rooms.iter().find(|room| {
            room.name == name
                && room.has_capacity()
                && policy.is_eligible(room)
                && self.process_index.contains_key(&room.process_id)
                && filter_by.iter().all(|field| match options.get(field) {
                    Some(expected) => room
                        .field(field)
                        .map_or(false, |actual| actual.matches_json(expected)),
                    None => true,
                })
        })
    }

    /// Lowest-score process, preferring those below the room target
    ///
    /// Ties go to the earlier process in snapshot order.
    pub fn pick_process(&self, target_rooms: Option<usize>) -> Option<&ProcessRecord> {
        if let Some(target) = target_rooms {
            let under_target = self
                .processes
                .iter()
                .filter(|p| self.rooms_on(&p.process_id) < target);
            if let Some(process) = lowest_score(under_target) {
                return Some(process);
            }
        }
        lowest_score(self.processes.iter())
    }

    /// Count one more client in a room and charge its process
    pub fn record_join(&mut self, room_id: &str, policy: &MatchmakingPolicy) -> Result<RoomRecord> {
        let index = *self.room_index.get(room_id).ok_or_else(|| {
            MatchmakingError::InternalError {
                message: format!("room {} missing from tick snapshot", room_id),
            }
        })?;

        let before = self.rooms[index].clone();
        let room = &mut self.rooms[index];
        room.clients = room.clients.saturating_add(1);
        let after = room.clone();

        self.charge(&after.process_id, policy.score_delta(Some(&before), Some(&after)));
        Ok(after)
    }

    /// Place a new room and charge its process with its contribution
    pub fn record_create(&mut self, room: RoomRecord, policy: &MatchmakingPolicy) -> RoomRecord {
        self.charge(&room.process_id, policy.score_contribution(&room));
        self.synthesized += 1;
        self.insert_room(room.clone());
        room
    }

    fn charge(&mut self, process_id: &str, delta: f64) {
        if let Some(&i) = self.process_index.get(process_id) {
            self.processes[i].score += delta;
        }
    }
}

fn lowest_score<'a>(
    candidates: impl Iterator<Item = &'a ProcessRecord>,
) -> Option<&'a ProcessRecord> {
    candidates.fold(None, |best: Option<&'a ProcessRecord>, process| match best {
        Some(best) if best.score <= process.score => Some(best),
        _ => Some(process),
    })
}

/// Metadata copied onto a synthesized room from its matching criteria
pub fn criteria_metadata<'a>(
    filter_by: &'a [String],
    options: &'a ClientOptions,
) -> impl Iterator<Item = (String, FieldValue)> + 'a {
    filter_by.iter().filter_map(|field| {
        options
            .get(field)
            .map(|value| (field.clone(), FieldValue::from_json(value.clone())))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process(id: &str, score: f64) -> ProcessRecord {
        let mut process = ProcessRecord::new(id, "localhost:2567");
        process.score = score;
        process
    }

    #[test]
    fn test_pick_process_lowest_score_first_tie() {
        let snapshot = TickSnapshot::new(
            Vec::new(),
            vec![process("p1", 2.0), process("p2", 0.0), process("p3", 0.0)],
        );
        assert_eq!(snapshot.pick_process(None).unwrap().process_id, "p2");
    }

    #[test]
    fn test_pick_process_prefers_under_target() {
        let rooms = vec![RoomRecord::new("arena", "p1").with_room_id("r1")];
        let snapshot = TickSnapshot::new(rooms, vec![process("p1", 0.0), process("p2", 5.0)]);

        assert_eq!(snapshot.pick_process(Some(1)).unwrap().process_id, "p2");
        assert_eq!(snapshot.pick_process(None).unwrap().process_id, "p1");
    }

    #[test]
    fn test_find_joinable_respects_filters_and_capacity() {
        let policy = MatchmakingPolicy::default();
        let rooms = vec![
            RoomRecord::new("arena", "p1")
                .with_room_id("full")
                .with_clients(2)
                .with_max_clients(2),
            RoomRecord::new("arena", "p1")
                .with_room_id("casual")
                .with_max_clients(4)
                .with_metadata("mode", "casual"),
            RoomRecord::new("arena", "p1")
                .with_room_id("ranked")
                .with_max_clients(4)
                .with_metadata("mode", "ranked"),
        ];
        let snapshot = TickSnapshot::new(rooms, vec![process("p1", 0.0)]);
        let filter_by = vec!["mode".to_string()];

        let mut options = ClientOptions::new();
        options.insert("mode".to_string(), json!("ranked"));
        let found = snapshot.find_joinable("arena", &filter_by, &options, &policy);
        assert_eq!(found.unwrap().room_id, "ranked");

        // criteria absent from the options do not constrain
        let found = snapshot.find_joinable("arena", &filter_by, &ClientOptions::new(), &policy);
        assert_eq!(found.unwrap().room_id, "casual");

        assert!(snapshot
            .find_joinable("lobby", &filter_by, &options, &policy)
            .is_none());
    }

    #[test]
    fn test_join_and_create_charge_process() {
        let policy = MatchmakingPolicy::default();
        let rooms = vec![RoomRecord::new("arena", "p1")
            .with_room_id("r1")
            .with_clients(3)
            .with_max_clients(4)];
        let mut snapshot = TickSnapshot::new(rooms, vec![process("p1", 3.0)]);

        let joined = snapshot.record_join("r1", &policy).unwrap();
        assert_eq!(joined.clients, 4);
        assert_eq!(snapshot.process("p1").unwrap().score, 4.0);

        let created = RoomRecord::new("arena", "p1").with_room_id("r2").with_clients(1);
        snapshot.record_create(created, &policy);
        assert_eq!(snapshot.process("p1").unwrap().score, 5.0);
        assert_eq!(snapshot.rooms_on("p1"), 2);
        assert_eq!(snapshot.synthesized_rooms(), 1);
    }
}
