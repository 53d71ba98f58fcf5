//! Process registration, load scores and stale process cleanup

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::error::{not_found, MatchmakingError, Result};
use crate::record::{ProcessRecord, RoomRecord};
use crate::registry::rooms::{Registry, MAX_WRITE_ATTEMPTS};
use crate::store::{CommitOutcome, Transaction, WriteOp};

/// Rooms removed per cleanup batch
pub const CLEANUP_BATCH_SIZE: usize = 500;

/// Metadata equality filter applied to candidate processes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessFilter {
    conditions: BTreeMap<String, Value>,
}

impl ProcessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conditions(conditions: BTreeMap<String, Value>) -> Self {
        Self { conditions }
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, process: &ProcessRecord) -> bool {
        self.conditions.iter().all(|(field, expected)| match field.as_str() {
            "processId" => expected.as_str() == Some(process.process_id.as_str()),
            "publicAddress" => expected.as_str() == Some(process.public_address.as_str()),
            "secure" => expected.as_bool() == Some(process.secure),
            _ => process
                .metadata
                .get(field)
                .map_or(false, |value| value.matches_json(expected)),
        })
    }
}

impl Registry {
    /// Add a process with a zero score, or replace its record keeping the score
    pub async fn register_process(&self, process: &ProcessRecord) -> Result<()> {
        process.validate()?;
        let hash = self.keys.processes();
        let encoded = process.encode()?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.store.fetch(&hash, &process.process_id).await?;
            let is_new = current.is_none();

            let mut txn = Transaction::guarded(hash.clone(), process.process_id.clone(), current);
            txn.push(WriteOp::HashSet {
                hash: hash.clone(),
                id: process.process_id.clone(),
                value: encoded.clone(),
            });
            if is_new {
                txn.push(WriteOp::SortedAdd {
                    key: self.keys.process_scores(),
                    member: process.process_id.clone(),
                    score: 0.0,
                });
            }

            match self.store.commit(txn).await? {
                CommitOutcome::Committed => {
                    info!(
                        "Registered process {} at {}",
                        process.process_id, process.public_address
                    );
                    return Ok(());
                }
                CommitOutcome::Conflict => {
                    debug!(
                        "Process {} changed during registration, retrying (attempt {}/{})",
                        process.process_id, attempt, MAX_WRITE_ATTEMPTS
                    );
                }
            }
        }

        Err(MatchmakingError::IndexConsistency {
            message: format!(
                "registration of process {} gave up after {} concurrent modifications",
                process.process_id, MAX_WRITE_ATTEMPTS
            ),
        }
        .into())
    }

    /// Drop score changes aimed at processes that are not registered
    pub(crate) async fn retain_registered_scores(&self, ops: Vec<WriteOp>) -> Result<Vec<WriteOp>> {
        let scores_key = self.keys.process_scores();
        let hash = self.keys.processes();

        let mut registered: HashMap<String, bool> = HashMap::new();
        for op in &ops {
            if let WriteOp::SortedIncr { key, member, .. } = op {
                if *key == scores_key && !registered.contains_key(member) {
                    let known = self.store.fetch(&hash, member).await?.is_some();
                    if !known {
                        debug!("Skipping score change for unregistered process {}", member);
                    }
                    registered.insert(member.clone(), known);
                }
            }
        }

        Ok(ops
            .into_iter()
            .filter(|op| match op {
                WriteOp::SortedIncr { key, member, .. } if *key == scores_key => {
                    registered.get(member).copied().unwrap_or(false)
                }
                _ => true,
            })
            .collect())
    }

    /// Store a new snapshot of an existing process
    pub async fn save_process(&self, process: &ProcessRecord) -> Result<()> {
        process.validate()?;
        let hash = self.keys.processes();
        let encoded = process.encode()?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.store.fetch(&hash, &process.process_id).await?;
            if current.is_none() {
                return Err(not_found(format!(
                    "process {} is not registered",
                    process.process_id
                )));
            }

            let mut txn = Transaction::guarded(hash.clone(), process.process_id.clone(), current);
            txn.push(WriteOp::HashSet {
                hash: hash.clone(),
                id: process.process_id.clone(),
                value: encoded.clone(),
            });

            match self.store.commit(txn).await? {
                CommitOutcome::Committed => return Ok(()),
                CommitOutcome::Conflict => {
                    debug!(
                        "Process {} changed during save, retrying (attempt {}/{})",
                        process.process_id, attempt, MAX_WRITE_ATTEMPTS
                    );
                }
            }
        }

        Err(MatchmakingError::IndexConsistency {
            message: format!(
                "save of process {} gave up after {} concurrent modifications",
                process.process_id, MAX_WRITE_ATTEMPTS
            ),
        }
        .into())
    }

    pub async fn find_process(&self, process_id: &str) -> Result<Option<ProcessRecord>> {
        let Some(body) = self.store.fetch(&self.keys.processes(), process_id).await? else {
            return Ok(None);
        };
        let score = self
            .store
            .scores(&self.keys.process_scores())
            .await?
            .into_iter()
            .find(|(member, _)| member == process_id)
            .map_or(0.0, |(_, score)| score);
        ProcessRecord::decode(&body, score).map(Some)
    }

    /// Unlocked processes matching the filter, least loaded first
    pub async fn query_processes(&self, filter: &ProcessFilter) -> Result<Vec<ProcessRecord>> {
        let scores: HashMap<String, f64> = self
            .store
            .scores(&self.keys.process_scores())
            .await?
            .into_iter()
            .collect();

        let mut processes = Vec::new();
        for (process_id, body) in self.store.fetch_all(&self.keys.processes()).await? {
            let score = scores.get(&process_id).copied().unwrap_or(0.0);
            match ProcessRecord::decode(&body, score) {
                Ok(process) if !process.locked && filter.matches(&process) => {
                    processes.push(process)
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable process {}: {}", process_id, e),
            }
        }

        processes.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        Ok(processes)
    }

    /// Process that owns a room
    pub async fn process_for_room(&self, room: &RoomRecord) -> Result<Option<ProcessRecord>> {
        self.find_process(&room.process_id).await
    }

    /// Drop a process record and its score; `false` if it was not registered
    pub async fn deregister_process(&self, process_id: &str) -> Result<bool> {
        let existed = self
            .store
            .fetch(&self.keys.processes(), process_id)
            .await?
            .is_some();

        let mut txn = Transaction::new();
        txn.push(WriteOp::HashDel {
            hash: self.keys.processes(),
            id: process_id.to_string(),
        });
        txn.push(WriteOp::SortedRem {
            key: self.keys.process_scores(),
            member: process_id.to_string(),
        });
        self.store.commit(txn).await?;

        if existed {
            info!("Deregistered process {}", process_id);
        }
        Ok(existed)
    }

    /// Remove every room owned by a dead process, then the process itself
    pub async fn cleanup_process(&self, process_id: &str) -> Result<usize> {
        let rooms = self.rooms_by_process(process_id).await?;
        info!(
            "Removing stale rooms by processId {} ({} rooms found)",
            process_id,
            rooms.len()
        );

        let mut removed = 0;
        for (batch, chunk) in rooms.chunks(CLEANUP_BATCH_SIZE).enumerate() {
            for room in chunk {
                if self.remove_room(&room.room_id).await? {
                    removed += 1;
                }
            }
            debug!(
                "Cleanup of process {}: batch {} done ({} rooms)",
                process_id,
                batch + 1,
                chunk.len()
            );
        }

        self.deregister_process(process_id).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_rooms_cleaned(removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_process_filter() {
        let process = ProcessRecord::new("p1", "10.0.0.1:2567")
            .with_metadata("region", "eu")
            .with_metadata("capacity", 8u32);

        assert!(ProcessFilter::new().matches(&process));
        assert!(ProcessFilter::new().eq("region", "eu").matches(&process));
        assert!(ProcessFilter::new()
            .eq("region", "eu")
            .eq("capacity", json!(8))
            .matches(&process));
        assert!(!ProcessFilter::new().eq("region", "us").matches(&process));
        assert!(!ProcessFilter::new().eq("zone", "a").matches(&process));
        assert!(ProcessFilter::new().eq("processId", "p1").matches(&process));
    }

    fn registry() -> Registry {
        let store = std::sync::Arc::new(crate::store::MemoryStore::new());
        Registry::new(store, &crate::config::RegistrySettings::default())
    }

    fn room(room_id: &str, clients: u32) -> RoomRecord {
        RoomRecord::new("arena", "p1")
            .with_room_id(room_id)
            .with_clients(clients)
            .with_max_clients(8)
    }

    async fn score_members(registry: &Registry) -> Vec<String> {
        registry
            .store
            .scores(&registry.keys.process_scores())
            .await
            .unwrap()
            .into_iter()
            .map(|(member, _)| member)
            .collect()
    }

    #[tokio::test]
    async fn test_reregistering_keeps_the_score() {
        let registry = registry();
        registry
            .register_process(&ProcessRecord::new("p1", "10.0.0.1:2567"))
            .await
            .unwrap();
        registry.create_room(&room("r1", 3)).await.unwrap();

        let moved = ProcessRecord::new("p1", "10.0.0.2:2567");
        registry.register_process(&moved).await.unwrap();

        let found = registry.find_process("p1").await.unwrap().unwrap();
        assert_eq!(found.public_address, "10.0.0.2:2567");
        assert_eq!(found.score, 3.0);
    }

    #[tokio::test]
    async fn test_room_removed_after_deregistration_leaves_no_score() {
        let registry = registry();
        registry
            .register_process(&ProcessRecord::new("p1", "10.0.0.1:2567"))
            .await
            .unwrap();
        registry.create_room(&room("r1", 3)).await.unwrap();

        assert!(registry.deregister_process("p1").await.unwrap());
        assert!(registry.remove_room("r1").await.unwrap());
        assert!(score_members(&registry).await.is_empty());

        registry
            .register_process(&ProcessRecord::new("p1", "10.0.0.1:2567"))
            .await
            .unwrap();
        assert_eq!(registry.find_process("p1").await.unwrap().unwrap().score, 0.0);
    }

    #[tokio::test]
    async fn test_rooms_of_unknown_processes_create_no_score() {
        let registry = registry();
        registry.create_room(&room("r1", 2)).await.unwrap();
        registry.remove_room("r1").await.unwrap();

        assert!(score_members(&registry).await.is_empty());
        assert!(registry.find_process("p1").await.unwrap().is_none());
    }
}
