//! Matchmaking scheduler configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// How `create` calls are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateBehavior {
    /// Through the request queue and the scheduler
    Queue,
    /// Resolved synchronously against the registry
    Dispatch,
}

impl FromStr for CreateBehavior {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(CreateBehavior::Queue),
            "dispatch" => Ok(CreateBehavior::Dispatch),
            other => Err(anyhow::anyhow!("Invalid create behavior: {}", other)),
        }
    }
}

/// Per room-name matchmaking definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDefinition {
    pub name: String,
    /// Capacity given to rooms synthesized by `create`
    #[serde(default)]
    pub max_clients: Option<u32>,
    /// Client option fields a room's metadata must match on `join`
    #[serde(default)]
    pub filter_by: Vec<String>,
}

impl RoomDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_clients: None,
            filter_by: Vec::new(),
        }
    }

    pub fn with_max_clients(mut self, max_clients: u32) -> Self {
        self.max_clients = Some(max_clients);
        self
    }

    pub fn with_filter_by(mut self, fields: &[&str]) -> Self {
        self.filter_by = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Matchmaking-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Interval between scheduler ticks in milliseconds
    pub tick_interval_ms: u64,
    pub create_behavior: CreateBehavior,
    /// Preferred upper bound of rooms per process when placing `create`s
    pub target_rooms_per_process: Option<usize>,
    /// Capacity for synthesized rooms without a definition
    pub default_max_clients: Option<u32>,
    pub rooms: Vec<RoomDefinition>,
    /// Equality conditions on process metadata
    pub process_filter: BTreeMap<String, Value>,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            create_behavior: CreateBehavior::Dispatch,
            target_rooms_per_process: None,
            default_max_clients: None,
            rooms: Vec::new(),
            process_filter: BTreeMap::new(),
        }
    }
}

impl MatchmakingSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn room(&self, name: &str) -> Option<&RoomDefinition> {
        self.rooms.iter().find(|room| room.name == name)
    }

    /// Capacity for a synthesized room, unbounded when nothing is configured
    pub fn max_clients_for(&self, name: &str) -> u32 {
        self.room(name)
            .and_then(|room| room.max_clients)
            .or(self.default_max_clients)
            .unwrap_or(u32::MAX)
    }

    pub fn filter_by_for(&self, name: &str) -> &[String] {
        self.room(name)
            .map(|room| room.filter_by.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_clients_resolution() {
        let settings = MatchmakingSettings {
            default_max_clients: Some(8),
            rooms: vec![RoomDefinition::new("duel").with_max_clients(2)],
            ..Default::default()
        };
        assert_eq!(settings.max_clients_for("duel"), 2);
        assert_eq!(settings.max_clients_for("arena"), 8);
        assert_eq!(MatchmakingSettings::default().max_clients_for("arena"), u32::MAX);
    }

    #[test]
    fn test_filter_by_lookup() {
        let settings = MatchmakingSettings {
            rooms: vec![RoomDefinition::new("arena").with_filter_by(&["mode"])],
            ..Default::default()
        };
        assert_eq!(settings.filter_by_for("arena"), ["mode".to_string()]);
        assert!(settings.filter_by_for("lobby").is_empty());
    }

    #[test]
    fn test_create_behavior_parsing() {
        assert_eq!("QUEUE".parse::<CreateBehavior>().unwrap(), CreateBehavior::Queue);
        assert!("later".parse::<CreateBehavior>().is_err());
    }
}
