//! In-process storage backend
//!
//! All structures live behind one mutex so a commit or drain is atomic with
//! respect to every other call. Each subscription owns an unbounded channel,
//! so a slow subscriber delays its own notifications but never loses them.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::{MatchmakingError, Result};
use crate::store::{
    CommitOutcome, Notification, NotificationStream, StoreBackend, Transaction, WriteOp,
};

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, BTreeMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    sorted: HashMap<String, HashMap<String, f64>>,
    queues: HashMap<String, VecDeque<String>>,
}

impl State {
    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::HashSet { hash, id, value } => {
                self.hashes.entry(hash).or_default().insert(id, value);
            }
            WriteOp::HashDel { hash, id } => {
                if let Some(entries) = self.hashes.get_mut(&hash) {
                    entries.remove(&id);
                    if entries.is_empty() {
                        self.hashes.remove(&hash);
                    }
                }
            }
            WriteOp::SetAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            WriteOp::SetRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
            WriteOp::SortedAdd { key, member, score } => {
                self.sorted.entry(key).or_default().insert(member, score);
            }
            WriteOp::SortedRem { key, member } => {
                if let Some(zset) = self.sorted.get_mut(&key) {
                    zset.remove(&member);
                    if zset.is_empty() {
                        self.sorted.remove(&key);
                    }
                }
            }
            WriteOp::SortedIncr { key, member, delta } => {
                *self.sorted.entry(key).or_default().entry(member).or_insert(0.0) += delta;
            }
        }
    }

    fn sorted_entries(&self, key: &str) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .sorted
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

/// Single-node backend used by tests, the simulator and local deployments
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    subscribers: Mutex<Vec<Subscriber>>,
}

#[derive(Debug)]
struct Subscriber {
    prefix: String,
    sender: mpsc::UnboundedSender<Notification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire store lock".to_string(),
            }
            .into()
        })
    }

    fn lock_subscribers(&self) -> Result<MutexGuard<'_, Vec<Subscriber>>> {
        self.subscribers.lock().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire subscriber lock".to_string(),
            }
            .into()
        })
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> Result<usize> {
        let mut subscribers = self.lock_subscribers()?;
        subscribers.retain(|s| !s.sender.is_closed());
        Ok(subscribers.len())
    }

    /// Every non-empty set key with its members
    pub fn set_snapshot(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Number of entries currently waiting in a queue
    pub fn queue_len(&self, queue: &str) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, hash: &str, id: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(hash).and_then(|h| h.get(id)).cloned())
    }

    async fn fetch_many(&self, hash: &str, ids: &[String]) -> Result<Vec<Option<String>>> {
        let state = self.lock()?;
        let entries = state.hashes.get(hash);
        Ok(ids
            .iter()
            .map(|id| entries.and_then(|h| h.get(id)).cloned())
            .collect())
    }

    async fn fetch_all(&self, hash: &str) -> Result<Vec<(String, String)>> {
        let state = self.lock()?;
        Ok(state
            .hashes
            .get(hash)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn intersect(&self, keys: &[String]) -> Result<Vec<String>> {
        let state = self.lock()?;
        let Some((first, rest)) = keys.split_first() else {
            return Ok(Vec::new());
        };
        let Some(base) = state.sets.get(first) else {
            return Ok(Vec::new());
        };

        Ok(base
            .iter()
            .filter(|member| {
                rest.iter().all(|key| {
                    state
                        .sets
                        .get(key)
                        .map(|s| s.contains(*member))
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect())
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .sorted_entries(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let state = self.lock()?;
        Ok(state.sorted_entries(key))
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        txn.validate()?;

        let mut state = self.lock()?;
        if let Some(guard) = &txn.guard {
            let current = state.hashes.get(&guard.hash).and_then(|h| h.get(&guard.id));
            if current != guard.expected.as_ref() {
                debug!("Guard conflict on {}/{}", guard.hash, guard.id);
                return Ok(CommitOutcome::Conflict);
            }
        }

        for op in txn.ops {
            state.apply(op);
        }

        Ok(CommitOutcome::Committed)
    }

    async fn push(&self, queue: &str, payload: String) -> Result<()> {
        let mut state = self.lock()?;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn drain(&self, queue: &str) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        Ok(state
            .queues
            .remove(queue)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut subscribers = self.lock_subscribers()?;
        // no receivers is not an error; closed subscriptions are pruned here
        subscribers.retain(|subscriber| {
            if !topic.starts_with(&subscriber.prefix) {
                return !subscriber.sender.is_closed();
            }
            let notification = Notification {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if subscriber.sender.send(notification).is_err() {
                debug!("Dropping closed subscription for '{}'", subscriber.prefix);
                return false;
            }
            true
        });
        Ok(())
    }

    async fn subscribe_prefix(&self, prefix: &str) -> Result<NotificationStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock_subscribers()?.push(Subscriber {
            prefix: prefix.to_string(),
            sender,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}
