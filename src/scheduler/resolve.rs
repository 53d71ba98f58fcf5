//! Resolution of a single request against a tick snapshot
//!
//! Used by the scheduler for queued requests and by the matchmaker for
//! dispatched ones.

use tracing::{debug, warn};

use crate::config::MatchmakingSettings;
use crate::error::{not_found, MatchmakingError, Result};
use crate::record::RoomRecord;
use crate::registry::Registry;
use crate::scheduler::snapshot::{criteria_metadata, TickSnapshot};
use crate::types::{
    ClientOptions, ConnectionSettings, MatchMethod, MatchResponse, ProcessAssignment,
    ResolvedMethod,
};
use crate::utils::{current_timestamp, generate_room_id};

/// Assignment chosen for one request
#[derive(Debug, Clone)]
pub struct Resolution {
    pub response: MatchResponse,
    /// Room synthesized by a `create`
    pub created: Option<RoomRecord>,
}

pub struct Resolver<'a> {
    registry: &'a Registry,
    settings: &'a MatchmakingSettings,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry, settings: &'a MatchmakingSettings) -> Self {
        Self { registry, settings }
    }

    pub async fn resolve(
        &self,
        snapshot: &mut TickSnapshot,
        method: MatchMethod,
        room_name_or_id: &str,
        options: &ClientOptions,
    ) -> Result<Resolution> {
        match method {
            MatchMethod::Join => self.join(snapshot, room_name_or_id, options),
            MatchMethod::Create => self.create(snapshot, room_name_or_id, options),
            MatchMethod::JoinOrCreate => match self.join(snapshot, room_name_or_id, options) {
                Err(e) if is_not_found(&e) => {
                    debug!("No '{}' room to join, creating one", room_name_or_id);
                    self.create(snapshot, room_name_or_id, options)
                }
                other => other,
            },
            MatchMethod::JoinById => self.join_by_id(snapshot, room_name_or_id, options).await,
            MatchMethod::Reconnect => self.reconnect(snapshot, room_name_or_id, options).await,
        }
    }

    fn join(
        &self,
        snapshot: &mut TickSnapshot,
        name: &str,
        options: &ClientOptions,
    ) -> Result<Resolution> {
        let policy = self.registry.policy();
        let room_id = snapshot
            .find_joinable(name, self.settings.filter_by_for(name), options, policy)
            .map(|room| room.room_id.clone())
            .ok_or_else(|| not_found(format!("no eligible '{}' room to join", name)))?;

        let room = snapshot.record_join(&room_id, policy)?;
        let settings = route(snapshot, &room)?;
        Ok(resolution(ResolvedMethod::Join, &room, options, settings))
    }

    fn create(
        &self,
        snapshot: &mut TickSnapshot,
        name: &str,
        options: &ClientOptions,
    ) -> Result<Resolution> {
        let process = snapshot
            .pick_process(self.settings.target_rooms_per_process)
            .ok_or_else(|| not_found(format!("no process available to create '{}'", name)))?;
        let settings = process.connection_settings()?;

        let mut room = RoomRecord::new(name, process.process_id.clone())
            .with_room_id(generate_room_id())
            .with_clients(1)
            .with_max_clients(self.settings.max_clients_for(name));
        room.metadata
            .extend(criteria_metadata(self.settings.filter_by_for(name), options));

        let room = snapshot.record_create(room, self.registry.policy());
        let mut resolved = resolution(ResolvedMethod::Create, &room, options, settings);
        resolved.created = Some(room);
        Ok(resolved)
    }

    async fn join_by_id(
        &self,
        snapshot: &mut TickSnapshot,
        room_id: &str,
        options: &ClientOptions,
    ) -> Result<Resolution> {
        let room = self.locate(snapshot, room_id).await?;
        if room.locked {
            return Err(not_found(format!("room {} is locked", room_id)));
        }
        if !room.has_capacity() {
            return Err(not_found(format!("room {} is full", room_id)));
        }
        let settings = route(snapshot, &room)?;

        let room = snapshot.record_join(room_id, self.registry.policy())?;
        Ok(resolution(ResolvedMethod::JoinById, &room, options, settings))
    }

    async fn reconnect(
        &self,
        snapshot: &mut TickSnapshot,
        room_id: &str,
        options: &ClientOptions,
    ) -> Result<Resolution> {
        let room = self.locate(snapshot, room_id).await?;
        let settings = route(snapshot, &room)?;
        Ok(resolution(ResolvedMethod::Reconnect, &room, options, settings))
    }

    /// Room from the snapshot, falling back to the registry
    async fn locate(&self, snapshot: &mut TickSnapshot, room_id: &str) -> Result<RoomRecord> {
        if let Some(room) = snapshot.room(room_id) {
            return Ok(room.clone());
        }

        let room = self
            .registry
            .find_room(room_id)
            .await?
            .ok_or_else(|| not_found(format!("room {} not found", room_id)))?;

        if snapshot.process(&room.process_id).is_none() {
            if let Some(process) = self.registry.process_for_room(&room).await? {
                snapshot.insert_process(process);
            }
        }
        snapshot.insert_room(room.clone());
        Ok(room)
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::NotFound { .. })
    )
}

/// Connection settings of the process owning `room`
fn route(snapshot: &TickSnapshot, room: &RoomRecord) -> Result<ConnectionSettings> {
    snapshot
        .process(&room.process_id)
        .ok_or_else(|| {
            not_found(format!(
                "process {} owning room {} is not available",
                room.process_id, room.room_id
            ))
        })?
        .connection_settings()
}

fn resolution(
    method: ResolvedMethod,
    room: &RoomRecord,
    options: &ClientOptions,
    settings: ConnectionSettings,
) -> Resolution {
    Resolution {
        response: MatchResponse {
            method,
            room_name: room.name.clone(),
            room_id: room.room_id.clone(),
            process_id: room.process_id.clone(),
            options: options.clone(),
            settings,
        },
        created: None,
    }
}

/// Tell the owning process about a room it has been asked to create
pub async fn announce_assignment(
    registry: &Registry,
    request_id: Option<&str>,
    room: &RoomRecord,
    options: &ClientOptions,
) {
    let assignment = ProcessAssignment {
        request_id: request_id.map(str::to_string),
        room_id: room.room_id.clone(),
        room_name: room.name.clone(),
        options: options.clone(),
        assigned_at: current_timestamp(),
    };

    let payload = match serde_json::to_string(&assignment) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode assignment of room {}: {}", room.room_id, e);
            return;
        }
    };

    let topic = registry.keys().process_topic(&room.process_id);
    if let Err(e) = registry.store().publish(&topic, payload).await {
        warn!(
            "Failed to notify process {} of room {}: {}",
            room.process_id, room.room_id, e
        );
    }
}
