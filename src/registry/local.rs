//! Rooms created through this registry instance
//!
//! Used when no external scheduler runs: queries only look at rooms this
//! instance owns.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{MatchmakingError, Result};
use crate::record::RoomRecord;

/// Attempts made after an empty local query before giving up
pub const LOCAL_QUERY_RETRIES: u32 = 10;

/// Delay between empty local query attempts
pub const LOCAL_QUERY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct LocalRooms {
    rooms: Mutex<Vec<RoomRecord>>,
}

impl LocalRooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<RoomRecord>>> {
        self.rooms.lock().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire local rooms lock".to_string(),
            }
            .into()
        })
    }

    /// Track a room, replacing an older snapshot with the same id
    pub fn upsert(&self, room: &RoomRecord) -> Result<()> {
        let mut rooms = self.lock()?;
        match rooms.iter_mut().find(|r| r.room_id == room.room_id) {
            Some(existing) => *existing = room.clone(),
            None => rooms.push(room.clone()),
        }
        Ok(())
    }

    /// Refresh a tracked room; untracked rooms are ignored
    pub fn refresh(&self, room: &RoomRecord) -> Result<()> {
        let mut rooms = self.lock()?;
        if let Some(existing) = rooms.iter_mut().find(|r| r.room_id == room.room_id) {
            *existing = room.clone();
        }
        Ok(())
    }

    pub fn remove(&self, room_id: &str) -> Result<()> {
        self.lock()?.retain(|r| r.room_id != room_id);
        Ok(())
    }

    pub fn contains(&self, room_id: &str) -> Result<bool> {
        Ok(self.lock()?.iter().any(|r| r.room_id == room_id))
    }

    pub fn filter(&self, predicate: impl Fn(&RoomRecord) -> bool) -> Result<Vec<RoomRecord>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_refresh_remove() {
        let local = LocalRooms::new();
        let room = RoomRecord::new("arena", "p1").with_room_id("r1");
        local.upsert(&room).unwrap();
        local.upsert(&room.clone().with_clients(2)).unwrap();
        assert_eq!(local.len().unwrap(), 1);

        // refresh never adds
        local
            .refresh(&RoomRecord::new("arena", "p1").with_room_id("r2"))
            .unwrap();
        assert!(!local.contains("r2").unwrap());

        let found = local.filter(|r| r.clients == 2).unwrap();
        assert_eq!(found.len(), 1);

        local.remove("r1").unwrap();
        assert!(local.is_empty().unwrap());
    }
}
