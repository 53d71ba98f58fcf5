//! Process score contributions
//!
//! A room contributes a number to its owning process's score; lower totals
//! are preferred when placing new rooms. Scores are maintained by delta.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::record::RoomRecord;

/// Room name that selects the fallback score function
pub const WILDCARD: &str = "*";

/// Computes how much a room adds to its process's score
pub trait ScoreFunction: Send + Sync {
    fn contribution(&self, room: &RoomRecord) -> f64;
}

impl<F> ScoreFunction for F
where
    F: Fn(&RoomRecord) -> f64 + Send + Sync,
{
    fn contribution(&self, room: &RoomRecord) -> f64 {
        self(room)
    }
}

/// One point per connected client
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCountScore;

impl ScoreFunction for ClientCountScore {
    fn contribution(&self, room: &RoomRecord) -> f64 {
        room.clients as f64
    }
}

/// Score functions keyed by room name with a wildcard fallback
#[derive(Clone)]
pub struct ScoreTable {
    by_name: HashMap<String, Arc<dyn ScoreFunction>>,
    fallback: Arc<dyn ScoreFunction>,
}

impl ScoreTable {
    pub fn new(fallback: Arc<dyn ScoreFunction>) -> Self {
        Self {
            by_name: HashMap::new(),
            fallback,
        }
    }

    /// Register a function for a room name; `"*"` replaces the fallback
    pub fn insert(&mut self, room_name: impl Into<String>, function: Arc<dyn ScoreFunction>) {
        let room_name = room_name.into();
        if room_name == WILDCARD {
            self.fallback = function;
        } else {
            self.by_name.insert(room_name, function);
        }
    }

    pub fn function_for(&self, room_name: &str) -> &Arc<dyn ScoreFunction> {
        self.by_name.get(room_name).unwrap_or(&self.fallback)
    }

    pub fn contribution(&self, room: &RoomRecord) -> f64 {
        self.function_for(&room.name).contribution(room)
    }
}

impl Default for ScoreTable {
    fn default() -> Self {
        Self::new(Arc::new(ClientCountScore))
    }
}

impl fmt::Debug for ScoreTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("ScoreTable").field("by_name", &names).finish()
    }
}
