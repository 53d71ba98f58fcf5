//! Room records and `$set` / `$inc` style updates

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{MatchmakingError, Result};
use crate::record::schema::{FieldValue, MetadataSchema, ELIGIBLE_FIELD, ROOM_ID_FIELD};
use crate::types::{ProcessId, RoomId};
use crate::utils::{current_timestamp, generate_room_id};

fn unbounded() -> u32 {
    u32::MAX
}

/// A live room as stored in the registry
///
/// `eligibleForMatchmaking` is not a field: it is derived from the policy
/// whenever a record is read or indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub process_id: ProcessId,
    pub name: String,
    #[serde(default)]
    pub clients: u32,
    #[serde(default = "unbounded")]
    pub max_clients: u32,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
}

impl RoomRecord {
    /// Create a new empty room with a generated id
    pub fn new(name: impl Into<String>, process_id: impl Into<ProcessId>) -> Self {
        Self {
            room_id: generate_room_id(),
            process_id: process_id.into(),
            name: name.into(),
            clients: 0,
            max_clients: unbounded(),
            locked: false,
            private: false,
            unlisted: false,
            metadata: BTreeMap::new(),
            created_at: current_timestamp(),
        }
    }

    pub fn with_room_id(mut self, room_id: impl Into<RoomId>) -> Self {
        self.room_id = room_id.into();
        self
    }

    pub fn with_clients(mut self, clients: u32) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_max_clients(mut self, max_clients: u32) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_metadata(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.clients < self.max_clients
    }

    /// Look up a built-in or metadata field by its schema name
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            ROOM_ID_FIELD => Some(FieldValue::String(self.room_id.clone())),
            "processId" => Some(FieldValue::String(self.process_id.clone())),
            "name" => Some(FieldValue::String(self.name.clone())),
            "clients" => Some(FieldValue::Number(self.clients as f64)),
            "maxClients" => Some(FieldValue::Number(self.max_clients as f64)),
            "locked" => Some(FieldValue::Boolean(self.locked)),
            "private" => Some(FieldValue::Boolean(self.private)),
            "unlisted" => Some(FieldValue::Boolean(self.unlisted)),
            "createdAt" => Some(FieldValue::Number(
                self.created_at.timestamp_millis() as f64,
            )),
            ELIGIBLE_FIELD => None,
            other => self.metadata.get(other).cloned(),
        }
    }

    /// Assign a built-in or metadata field by its schema name
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let invalid = |reason: String| -> anyhow::Error {
            MatchmakingError::InvalidRequest { reason }.into()
        };

        match name {
            ROOM_ID_FIELD => {
                return Err(invalid("roomId cannot be changed".to_string()));
            }
            // derived, silently ignored
            ELIGIBLE_FIELD => {}
            "processId" | "name" => {
                let text = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("{} must be a string", name)))?
                    .to_string();
                if name == "processId" {
                    self.process_id = text;
                } else {
                    self.name = text;
                }
            }
            "clients" | "maxClients" => {
                let n = value
                    .as_f64()
                    .filter(|n| *n >= 0.0 && n.is_finite())
                    .ok_or_else(|| invalid(format!("{} must be a non-negative number", name)))?;
                let n = n.min(u32::MAX as f64) as u32;
                if name == "clients" {
                    self.clients = n;
                } else {
                    self.max_clients = n;
                }
            }
            "locked" | "private" | "unlisted" => {
                let flag = value
                    .as_bool()
                    .ok_or_else(|| invalid(format!("{} must be a boolean", name)))?;
                match name {
                    "locked" => self.locked = flag,
                    "private" => self.private = flag,
                    _ => self.unlisted = flag,
                }
            }
            "createdAt" => {
                let millis = value
                    .as_f64()
                    .ok_or_else(|| invalid("createdAt must be a number".to_string()))?;
                self.created_at = Utc
                    .timestamp_millis_opt(millis as i64)
                    .single()
                    .ok_or_else(|| invalid(format!("invalid createdAt {}", millis)))?;
            }
            other => {
                self.metadata.insert(other.to_string(), value);
            }
        }
        Ok(())
    }

    /// Serialize into the stored body
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            MatchmakingError::Serialization {
                message: format!("failed to encode room {}: {}", self.room_id, e),
            }
            .into()
        })
    }

    /// Deserialize a stored body, coercing metadata to the schema's types
    pub fn decode(body: &str, schema: &MetadataSchema) -> Result<Self> {
        let mut raw: Map<String, Value> = serde_json::from_str(body).map_err(|e| {
            MatchmakingError::Serialization {
                message: format!("failed to decode room body: {}", e),
            }
        })?;

        let metadata = match raw.remove("metadata") {
            Some(Value::Object(fields)) => fields
                .into_iter()
                .map(|(k, v)| Ok((k.clone(), schema.coerce(&k, v)?)))
                .collect::<Result<BTreeMap<_, _>>>()?,
            _ => BTreeMap::new(),
        };

        let mut room: RoomRecord =
            serde_json::from_value(Value::Object(raw)).map_err(|e| {
                MatchmakingError::Serialization {
                    message: format!("failed to decode room body: {}", e),
                }
            })?;
        room.metadata = metadata;
        Ok(room)
    }
}

/// `$set` / `$inc` style partial update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    #[serde(default, rename = "$set")]
    pub set: Map<String, Value>,
    #[serde(default, rename = "$inc")]
    pub inc: BTreeMap<String, f64>,
}

impl RoomUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn inc(mut self, field: impl Into<String>, delta: f64) -> Self {
        *self.inc.entry(field.into()).or_insert(0.0) += delta;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty()
    }

    /// Apply the update to a record: sets first, then increments
    pub fn apply(&self, room: &mut RoomRecord, schema: &MetadataSchema) -> Result<()> {
        for (field, value) in &self.set {
            let value = schema.coerce(field, value.clone())?;
            room.set_field(field, value)?;
        }

        for (field, delta) in &self.inc {
            let current = match room.field(field) {
                Some(FieldValue::Number(n)) => n,
                None => 0.0,
                Some(_) => {
                    return Err(MatchmakingError::InvalidRequest {
                        reason: format!("cannot increment non-numeric field '{}'", field),
                    }
                    .into())
                }
            };
            let next = match field.as_str() {
                "clients" | "maxClients" => (current + delta).max(0.0),
                _ => current + delta,
            };
            room.set_field(field, FieldValue::Number(next))?;
        }

        Ok(())
    }
}
