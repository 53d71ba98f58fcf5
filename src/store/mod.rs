//! Storage backend capability contract
//!
//! The registry, request queue and response channel only talk to a
//! [`StoreBackend`]: point lookups on hashes, set and sorted-set reads, an
//! atomic guarded multi-key commit, a FIFO queue with atomic drain, and
//! prefix-based publish/subscribe.

pub mod memory;
#[cfg(feature = "postgres-store")]
pub mod postgres;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "postgres-store")]
pub use postgres::PostgresStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

use crate::config::{RegistryBackend, RegistrySettings};
use crate::error::{MatchmakingError, Result};

/// A published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub payload: String,
}

/// Stream of notifications for one subscription
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Compare-and-set precondition on one hash entry
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub hash: String,
    pub id: String,
    /// Expected current body, `None` meaning the entry must be absent
    pub expected: Option<String>,
}

/// A single write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    HashSet {
        hash: String,
        id: String,
        value: String,
    },
    HashDel {
        hash: String,
        id: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRem {
        key: String,
        member: String,
    },
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedRem {
        key: String,
        member: String,
    },
    SortedIncr {
        key: String,
        member: String,
        delta: f64,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::HashSet { hash, .. } | WriteOp::HashDel { hash, .. } => hash,
            WriteOp::SetAdd { key, .. }
            | WriteOp::SetRem { key, .. }
            | WriteOp::SortedAdd { key, .. }
            | WriteOp::SortedRem { key, .. }
            | WriteOp::SortedIncr { key, .. } => key,
        }
    }

    /// Reject ops a backend could only partially apply
    pub fn validate(&self) -> Result<()> {
        if self.key().is_empty() {
            return Err(MatchmakingError::IndexConsistency {
                message: format!("write targets an empty key: {:?}", self),
            }
            .into());
        }
        match self {
            WriteOp::SortedAdd { score: n, key, .. } | WriteOp::SortedIncr { delta: n, key, .. }
                if !n.is_finite() =>
            {
                Err(MatchmakingError::IndexConsistency {
                    message: format!("non-finite score {} for sorted set {}", n, key),
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}

/// Guarded, ordered batch of writes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub guard: Option<Guard>,
    pub ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guarded(hash: impl Into<String>, id: impl Into<String>, expected: Option<String>) -> Self {
        Self {
            guard: Some(Guard {
                hash: hash.into(),
                id: id.into(),
                expected,
            }),
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) {
        self.ops.extend(ops);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.ops.iter().try_for_each(WriteOp::validate)
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The guard did not hold; nothing was written
    Conflict,
}

/// Capabilities the matchmaking core needs from shared storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    async fn fetch(&self, hash: &str, id: &str) -> Result<Option<String>>;

    /// Values in the same order as `ids`
    async fn fetch_many(&self, hash: &str, ids: &[String]) -> Result<Vec<Option<String>>>;

    async fn fetch_all(&self, hash: &str) -> Result<Vec<(String, String)>>;

    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Intersection of every set in `keys`; empty when `keys` is empty
    async fn intersect(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Members with `min <= score <= max`, ascending
    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    /// All members with their scores, ascending
    async fn scores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Apply a transaction atomically
    async fn commit(&self, txn: Transaction) -> Result<CommitOutcome>;

    async fn push(&self, queue: &str, payload: String) -> Result<()>;

    /// Atomically read and clear a queue, oldest first
    async fn drain(&self, queue: &str) -> Result<Vec<String>>;

    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Subscribe to every topic starting with `prefix`
    async fn subscribe_prefix(&self, prefix: &str) -> Result<NotificationStream>;
}

/// Build the backend selected by configuration
pub async fn connect(settings: &RegistrySettings) -> Result<Arc<dyn StoreBackend>> {
    info!("Connecting registry backend: {:?}", settings.backend);

    match settings.backend {
        RegistryBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis-store")]
        RegistryBackend::Redis => {
            let url = settings.require_url()?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
        #[cfg(feature = "postgres-store")]
        RegistryBackend::Postgres => {
            let url = settings.require_url()?;
            Ok(Arc::new(
                PostgresStore::connect(url, &settings.key_prefix).await?,
            ))
        }
        #[allow(unreachable_patterns)]
        other => Err(MatchmakingError::ConfigurationError {
            message: format!(
                "registry backend {:?} is not compiled in; enable its cargo feature",
                other
            ),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_non_finite_scores() {
        let mut txn = Transaction::new();
        txn.push(WriteOp::SetAdd {
            key: "rooms:ids".to_string(),
            member: "r1".to_string(),
        });
        assert!(txn.validate().is_ok());

        txn.push(WriteOp::SortedIncr {
            key: "rooms:processes:score".to_string(),
            member: "p1".to_string(),
            delta: f64::NAN,
        });
        let err = txn.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::IndexConsistency { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        let op = WriteOp::HashDel {
            hash: String::new(),
            id: "r1".to_string(),
        };
        assert!(op.validate().is_err());
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let settings = RegistrySettings::default();
        let store = connect(&settings).await.unwrap();
        assert_eq!(store.name(), "memory");
    }
}
