//! Room registry: guarded record writes with index maintenance, and queries

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{RegistryMode, RegistrySettings};
use crate::error::{not_found, MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::policy::MatchmakingPolicy;
use crate::record::schema::{FieldType, FieldValue, ROOM_ID_FIELD};
use crate::record::{MetadataSchema, RoomRecord, RoomUpdate};
use crate::registry::index::{plan_room_remove, plan_room_write};
use crate::registry::keys::KeyLayout;
use crate::registry::local::{LocalRooms, LOCAL_QUERY_INTERVAL, LOCAL_QUERY_RETRIES};
use crate::registry::query::{Condition, RoomQuery};
use crate::store::{CommitOutcome, StoreBackend, Transaction};

/// Read-plan-commit cycles attempted before a write gives up
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Durable store of rooms and processes with per-field secondary indexes
pub struct Registry {
    pub(crate) store: Arc<dyn StoreBackend>,
    pub(crate) keys: KeyLayout,
    pub(crate) schema: MetadataSchema,
    pub(crate) policy: MatchmakingPolicy,
    pub(crate) mode: RegistryMode,
    pub(crate) local: LocalRooms,
    pub(crate) metrics: Option<Arc<MetricsCollector>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.store.name())
            .field("keys", &self.keys)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn StoreBackend>, settings: &RegistrySettings) -> Self {
        Self {
            store,
            keys: KeyLayout::new(settings.key_prefix.clone()),
            schema: settings.schema(),
            policy: MatchmakingPolicy::default(),
            mode: settings.mode,
            local: LocalRooms::new(),
            metrics: None,
        }
    }

    pub fn with_policy(mut self, policy: MatchmakingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_schema(mut self, schema: MetadataSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_mode(mut self, mode: RegistryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn StoreBackend> {
        &self.store
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }

    pub fn policy(&self) -> &MatchmakingPolicy {
        &self.policy
    }

    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    pub fn is_local(&self) -> bool {
        self.mode == RegistryMode::Local
    }

    /// Read the current snapshot, derive the next one, and commit it with
    /// its index changes guarded on the snapshot that was read
    async fn write_room<F>(
        &self,
        operation: &str,
        room_id: &str,
        mut transition: F,
    ) -> Result<(Option<RoomRecord>, Option<RoomRecord>)>
    where
        F: FnMut(Option<&RoomRecord>) -> Result<Option<RoomRecord>> + Send,
    {
        let started = Instant::now();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let body = self.store.fetch(self.keys.rooms(), room_id).await?;
            let previous = body
                .as_deref()
                .map(|b| RoomRecord::decode(b, &self.schema))
                .transpose()?;
            let next = transition(previous.as_ref())?;

            let ops = match (&previous, &next) {
                (_, Some(next)) => {
                    plan_room_write(&self.keys, &self.schema, &self.policy, previous.as_ref(), next)?
                }
                (Some(previous), None) => {
                    plan_room_remove(&self.keys, &self.schema, &self.policy, previous)
                }
                (None, None) => return Ok((None, None)),
            };
            let ops = self.retain_registered_scores(ops).await?;

            let mut txn = Transaction::guarded(self.keys.rooms(), room_id, body);
            txn.extend(ops);
            let op_count = txn.len();

            match self.store.commit(txn).await {
                Ok(CommitOutcome::Committed) => {
                    debug!(
                        "Room {} {} committed ({} ops, attempt {})",
                        room_id, operation, op_count, attempt
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_registry_write(operation, true, started.elapsed());
                    }
                    return Ok((previous, next));
                }
                Ok(CommitOutcome::Conflict) => {
                    debug!(
                        "Room {} changed during {}, retrying (attempt {}/{})",
                        room_id, operation, attempt, MAX_WRITE_ATTEMPTS
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_index_conflict();
                    }
                }
                Err(e) => {
                    error!("Room {} {} aborted: {}", room_id, operation, e);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_registry_write(operation, false, started.elapsed());
                    }
                    return Err(MatchmakingError::IndexConsistency {
                        message: format!("{} of room {} aborted: {}", operation, room_id, e),
                    }
                    .into());
                }
            }
        }

        warn!(
            "Room {} {} gave up after {} conflicting attempts",
            room_id, operation, MAX_WRITE_ATTEMPTS
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_registry_write(operation, false, started.elapsed());
        }
        Err(MatchmakingError::IndexConsistency {
            message: format!(
                "{} of room {} gave up after {} concurrent modifications",
                operation, room_id, MAX_WRITE_ATTEMPTS
            ),
        }
        .into())
    }

    fn validate_room(room: &RoomRecord) -> Result<()> {
        if room.room_id.is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "room record requires a roomId".to_string(),
            }
            .into());
        }
        if room.process_id.is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: format!("room {} requires a processId", room.room_id),
            }
            .into());
        }
        Ok(())
    }

    /// Persist a room and index every schema field; overwrites an existing
    /// record with the same id
    pub async fn create_room(&self, room: &RoomRecord) -> Result<()> {
        Self::validate_room(room)?;
        self.write_room("create", &room.room_id, |_| Ok(Some(room.clone())))
            .await?;

        if self.is_local() {
            self.local.upsert(room)?;
        }

        info!(
            "Created room {} ({}) on process {}",
            room.room_id, room.name, room.process_id
        );
        Ok(())
    }

    /// Store a new snapshot of an existing room
    pub async fn save_room(&self, room: &RoomRecord) -> Result<()> {
        Self::validate_room(room)?;
        self.write_room("save", &room.room_id, |previous| match previous {
            Some(_) => Ok(Some(room.clone())),
            None => Err(not_found(format!("room {} does not exist", room.room_id))),
        })
        .await?;

        if self.is_local() {
            self.local.refresh(room)?;
        }
        Ok(())
    }

    /// Apply `$set` / `$inc` style changes to the stored room
    pub async fn update_room(&self, room_id: &str, update: &RoomUpdate) -> Result<RoomRecord> {
        let schema = &self.schema;
        let (_, next) = self
            .write_room("update", room_id, |previous| {
                let mut room = previous
                    .cloned()
                    .ok_or_else(|| not_found(format!("room {} does not exist", room_id)))?;
                update.apply(&mut room, schema)?;
                Ok(Some(room))
            })
            .await?;

        let room = next.ok_or_else(|| MatchmakingError::InternalError {
            message: format!("update of room {} produced no record", room_id),
        })?;

        if self.is_local() {
            self.local.refresh(&room)?;
        }
        Ok(room)
    }

    /// Delete a room and all its index entries; `false` if it was absent
    pub async fn remove_room(&self, room_id: &str) -> Result<bool> {
        let (previous, _) = self.write_room("remove", room_id, |_| Ok(None)).await?;

        if self.is_local() {
            self.local.remove(room_id)?;
        }

        match previous {
            Some(room) => {
                info!("Removed room {} from process {}", room_id, room.process_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn find_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        self.store
            .fetch(self.keys.rooms(), room_id)
            .await?
            .map(|body| RoomRecord::decode(&body, &self.schema))
            .transpose()
    }

    pub async fn has_room(&self, room_id: &str) -> Result<bool> {
        if self.is_local() {
            return self.local.contains(room_id);
        }
        Ok(self.store.fetch(self.keys.rooms(), room_id).await?.is_some())
    }

    /// Rooms matching every condition, oldest first
    pub async fn query_rooms(&self, query: &RoomQuery) -> Result<Vec<RoomRecord>> {
        if self.is_local() {
            self.query_local(query).await
        } else {
            self.query_shared(query).await
        }
    }

    pub async fn find_one(&self, query: &RoomQuery) -> Result<Option<RoomRecord>> {
        Ok(self.query_rooms(query).await?.into_iter().next())
    }

    /// Rooms currently satisfying the eligibility predicate
    pub async fn eligible_rooms(&self) -> Result<Vec<RoomRecord>> {
        self.query_rooms(&RoomQuery::eligible()).await
    }

    /// Rooms owned by a process, without the local-mode retry window
    pub async fn rooms_by_process(&self, process_id: &str) -> Result<Vec<RoomRecord>> {
        if self.is_local() {
            let mut rooms = self.local.filter(|r| r.process_id == process_id)?;
            sort_rooms(&mut rooms);
            return Ok(rooms);
        }
        self.query_shared(&RoomQuery::new().eq("processId", process_id))
            .await
    }

    async fn query_local(&self, query: &RoomQuery) -> Result<Vec<RoomRecord>> {
        for attempt in 0..=LOCAL_QUERY_RETRIES {
            let mut rooms = self.local.filter(|r| query.matches(r, &self.policy))?;
            if !rooms.is_empty() {
                sort_rooms(&mut rooms);
                return Ok(rooms);
            }
            if attempt < LOCAL_QUERY_RETRIES {
                debug!(
                    "Local query found no rooms, retrying ({}/{})",
                    attempt + 1,
                    LOCAL_QUERY_RETRIES
                );
                tokio::time::sleep(LOCAL_QUERY_INTERVAL).await;
            }
        }
        Ok(Vec::new())
    }

    async fn query_shared(&self, query: &RoomQuery) -> Result<Vec<RoomRecord>> {
        if let Some(Condition::Eq(FieldValue::String(room_id))) = query.get(ROOM_ID_FIELD) {
            let room = self.find_room(room_id).await?;
            return Ok(room
                .into_iter()
                .filter(|r| query.matches(r, &self.policy))
                .collect());
        }

        let mut set_keys = Vec::new();
        let mut narrowed: Option<BTreeSet<String>> = None;

        for (field, condition) in query.conditions() {
            let unsupported = |detail: &str| -> anyhow::Error {
                MatchmakingError::UnsupportedOperation {
                    message: format!("cannot query field '{}': {}", field, detail),
                }
                .into()
            };

            let field_type = self
                .schema
                .field_type(field)
                .ok_or_else(|| unsupported("not in the metadata schema"))?;
            if field == ROOM_ID_FIELD {
                return Err(unsupported("roomId supports string equality only"));
            }

            match (field_type, condition) {
                (FieldType::Json, _) => return Err(unsupported("json fields are not indexed")),
                (FieldType::Boolean, Condition::Eq(FieldValue::Boolean(true))) => {
                    set_keys.push(self.keys.field(field));
                }
                (FieldType::Boolean, Condition::Eq(FieldValue::Boolean(false))) => {
                    let flagged: BTreeSet<String> = self
                        .store
                        .members(&self.keys.field(field))
                        .await?
                        .into_iter()
                        .collect();
                    let unflagged = self
                        .store
                        .members(&self.keys.room_ids())
                        .await?
                        .into_iter()
                        .filter(|id| !flagged.contains(id));
                    narrow(&mut narrowed, unflagged);
                }
                (FieldType::String, Condition::Eq(value @ FieldValue::String(_)))
                | (FieldType::Number, Condition::Eq(value @ FieldValue::Number(_))) => {
                    let token = value.index_token().unwrap_or_default();
                    set_keys.push(self.keys.field_value(field, &token));
                }
                (FieldType::Number, Condition::Range { min, max }) => {
                    let in_range = self
                        .store
                        .range_by_score(&self.keys.field(field), *min, *max)
                        .await?;
                    narrow(&mut narrowed, in_range);
                }
                (_, condition) => {
                    return Err(unsupported(&format!(
                        "{:?} does not apply to a {:?} field",
                        condition, field_type
                    )))
                }
            }
        }

        let ids: Vec<String> = match (set_keys.is_empty(), narrowed) {
            (true, Some(ids)) => ids.into_iter().collect(),
            (true, None) => self.store.members(&self.keys.room_ids()).await?,
            (false, narrowed) => self
                .store
                .intersect(&set_keys)
                .await?
                .into_iter()
                .filter(|id| narrowed.as_ref().map_or(true, |n| n.contains(id)))
                .collect(),
        };

        let mut rooms = self.load_rooms(&ids).await?;
        rooms.retain(|r| query.matches(r, &self.policy));
        sort_rooms(&mut rooms);
        Ok(rooms)
    }

    /// Fetch and decode rooms, skipping ids removed since they were read
    pub(crate) async fn load_rooms(&self, ids: &[String]) -> Result<Vec<RoomRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .fetch_many(self.keys.rooms(), ids)
            .await?
            .into_iter()
            .flatten()
            .map(|body| RoomRecord::decode(&body, &self.schema))
            .collect()
    }
}

fn narrow(current: &mut Option<BTreeSet<String>>, ids: impl IntoIterator<Item = String>) {
    let incoming: BTreeSet<String> = ids.into_iter().collect();
    *current = Some(match current.take() {
        Some(existing) => existing.intersection(&incoming).cloned().collect(),
        None => incoming,
    });
}

/// Deterministic order: creation time, then id
pub(crate) fn sort_rooms(rooms: &mut [RoomRecord]) {
    rooms.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.room_id.cmp(&b.room_id))
    });
}
