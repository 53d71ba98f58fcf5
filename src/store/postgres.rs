//! PostgreSQL storage backend
//!
//! Hashes, sets, sorted sets and queues are generic tables named after the
//! registry key prefix. A commit is one SQL transaction serialized per
//! guarded entry with a transaction-scoped advisory lock. Notifications use
//! `pg_notify` on one channel with the topic carried in the payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{storage, Result};
use crate::store::{
    CommitOutcome, Notification, NotificationStream, StoreBackend, Transaction, WriteOp,
};

const MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    payload: String,
}

#[derive(Debug, Clone)]
struct Tables {
    hash: String,
    set: String,
    zset: String,
    queue: String,
    channel: String,
}

impl Tables {
    fn for_prefix(prefix: &str) -> Self {
        let base: String = prefix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let base = if base.is_empty() { "roomcaches".to_string() } else { base };
        Self {
            hash: format!("{}_hash", base),
            set: format!("{}_set", base),
            zset: format!("{}_zset", base),
            queue: format!("{}_queue", base),
            channel: format!("{}_events", base),
        }
    }
}

/// Backend over a PostgreSQL database
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    url: String,
    tables: Tables,
}

impl PostgresStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL registry");

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(|e| storage(format!("Failed to connect to PostgreSQL: {e}")))?;

        let store = Self {
            pool,
            url: url.to_string(),
            tables: Tables::for_prefix(key_prefix),
        };
        store.ensure_schema().await?;

        info!("Successfully connected to PostgreSQL registry");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let t = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (hash TEXT NOT NULL, id TEXT NOT NULL, body TEXT NOT NULL, PRIMARY KEY (hash, id))",
                t.hash
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (key TEXT NOT NULL, member TEXT NOT NULL, PRIMARY KEY (key, member))",
                t.set
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (key TEXT NOT NULL, member TEXT NOT NULL, score DOUBLE PRECISION NOT NULL, PRIMARY KEY (key, member))",
                t.zset
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (seq BIGSERIAL PRIMARY KEY, queue TEXT NOT NULL, payload TEXT NOT NULL)",
                t.queue
            ),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| storage(format!("schema setup failed: {e}")))?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        op: &WriteOp,
    ) -> Result<()> {
        let t = &self.tables;
        let result = match op {
            WriteOp::HashSet { hash, id, value } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (hash, id, body) VALUES ($1, $2, $3) \
                     ON CONFLICT (hash, id) DO UPDATE SET body = EXCLUDED.body",
                    t.hash
                ))
                .bind(hash)
                .bind(id)
                .bind(value)
                .execute(&mut **tx)
                .await
            }
            WriteOp::HashDel { hash, id } => {
                sqlx::query(&format!("DELETE FROM {} WHERE hash = $1 AND id = $2", t.hash))
                    .bind(hash)
                    .bind(id)
                    .execute(&mut **tx)
                    .await
            }
            WriteOp::SetAdd { key, member } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    t.set
                ))
                .bind(key)
                .bind(member)
                .execute(&mut **tx)
                .await
            }
            WriteOp::SetRem { key, member } => {
                sqlx::query(&format!("DELETE FROM {} WHERE key = $1 AND member = $2", t.set))
                    .bind(key)
                    .bind(member)
                    .execute(&mut **tx)
                    .await
            }
            WriteOp::SortedAdd { key, member, score } => {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, member, score) VALUES ($1, $2, $3) \
                     ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score",
                    t.zset
                ))
                .bind(key)
                .bind(member)
                .bind(score)
                .execute(&mut **tx)
                .await
            }
            WriteOp::SortedRem { key, member } => {
                sqlx::query(&format!("DELETE FROM {} WHERE key = $1 AND member = $2", t.zset))
                    .bind(key)
                    .bind(member)
                    .execute(&mut **tx)
                    .await
            }
            WriteOp::SortedIncr { key, member, delta } => {
                sqlx::query(&format!(
                    "INSERT INTO {0} (key, member, score) VALUES ($1, $2, $3) \
                     ON CONFLICT (key, member) DO UPDATE SET score = {0}.score + EXCLUDED.score",
                    t.zset
                ))
                .bind(key)
                .bind(member)
                .bind(delta)
                .execute(&mut **tx)
                .await
            }
        };

        result
            .map(|_| ())
            .map_err(|e| storage(format!("write {:?} failed: {e}", op.key())))
    }
}

#[async_trait]
impl StoreBackend for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch(&self, hash: &str, id: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT body FROM {} WHERE hash = $1 AND id = $2",
            self.tables.hash
        ))
        .bind(hash)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage(format!("fetch failed: {e}")))
    }

    async fn fetch_many(&self, hash: &str, ids: &[String]) -> Result<Vec<Option<String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT id, body FROM {} WHERE hash = $1 AND id = ANY($2)",
            self.tables.hash
        ))
        .bind(hash)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("fetch_many failed: {e}")))?;

        let mut found: HashMap<String, String> = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(|e| storage(e.to_string()))?;
            let body: String = row.try_get("body").map_err(|e| storage(e.to_string()))?;
            found.insert(id, body);
        }
        Ok(ids.iter().map(|id| found.remove(id)).collect())
    }

    async fn fetch_all(&self, hash: &str) -> Result<Vec<(String, String)>> {
        sqlx::query_as::<_, (String, String)>(&format!(
            "SELECT id, body FROM {} WHERE hash = $1 ORDER BY id",
            self.tables.hash
        ))
        .bind(hash)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("fetch_all failed: {e}")))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT member FROM {} WHERE key = $1 ORDER BY member",
            self.tables.set
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("members failed: {e}")))
    }

    async fn intersect(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut distinct = keys.to_vec();
        distinct.sort();
        distinct.dedup();

        sqlx::query_scalar::<_, String>(&format!(
            "SELECT member FROM {} WHERE key = ANY($1) \
             GROUP BY member HAVING COUNT(DISTINCT key) = $2 ORDER BY member",
            self.tables.set
        ))
        .bind(&distinct)
        .bind(distinct.len() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("intersect failed: {e}")))
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(&format!(
            "SELECT member FROM {} WHERE key = $1 AND score >= $2 AND score <= $3 \
             ORDER BY score, member",
            self.tables.zset
        ))
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("range_by_score failed: {e}")))
    }

    async fn scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        sqlx::query_as::<_, (String, f64)>(&format!(
            "SELECT member, score FROM {} WHERE key = $1 ORDER BY score, member",
            self.tables.zset
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("scores failed: {e}")))
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        txn.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage(format!("begin transaction failed: {e}")))?;

        if let Some(guard) = &txn.guard {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("{}/{}", guard.hash, guard.id))
                .execute(&mut *tx)
                .await
                .map_err(|e| storage(format!("guard lock failed: {e}")))?;

            let current = sqlx::query_scalar::<_, String>(&format!(
                "SELECT body FROM {} WHERE hash = $1 AND id = $2 FOR UPDATE",
                self.tables.hash
            ))
            .bind(&guard.hash)
            .bind(&guard.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage(format!("guard read failed: {e}")))?;

            if current != guard.expected {
                debug!("Guard conflict on {}/{}", guard.hash, guard.id);
                // dropping the transaction rolls it back
                return Ok(CommitOutcome::Conflict);
            }
        }

        for op in &txn.ops {
            self.apply(&mut tx, op).await?;
        }

        tx.commit()
            .await
            .map_err(|e| storage(format!("commit transaction failed: {e}")))?;

        Ok(CommitOutcome::Committed)
    }

    async fn push(&self, queue: &str, payload: String) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (queue, payload) VALUES ($1, $2)",
            self.tables.queue
        ))
        .bind(queue)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| storage(format!("push failed: {e}")))?;
        Ok(())
    }

    async fn drain(&self, queue: &str) -> Result<Vec<String>> {
        let mut rows = sqlx::query_as::<_, (i64, String)>(&format!(
            "DELETE FROM {} WHERE queue = $1 RETURNING seq, payload",
            self.tables.queue
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(format!("drain failed: {e}")))?;

        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, payload)| payload).collect())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let envelope = serde_json::to_string(&Envelope {
            topic: topic.to_string(),
            payload,
        })
        .map_err(|e| storage(format!("failed to encode notification: {e}")))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.tables.channel)
            .bind(envelope)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(format!("pg_notify failed: {e}")))?;
        Ok(())
    }

    async fn subscribe_prefix(&self, prefix: &str) -> Result<NotificationStream> {
        let mut listener = PgListener::connect(&self.url)
            .await
            .map_err(|e| storage(format!("Failed to open PostgreSQL listener: {e}")))?;
        listener
            .listen(&self.tables.channel)
            .await
            .map_err(|e| storage(format!("LISTEN failed: {e}")))?;

        let prefix = prefix.to_string();
        let stream = listener.into_stream().filter_map(move |item| match item {
            Ok(notification) => match serde_json::from_str::<Envelope>(notification.payload()) {
                Ok(envelope) if envelope.topic.starts_with(&prefix) => Some(Notification {
                    topic: envelope.topic,
                    payload: envelope.payload,
                }),
                Ok(_) => None,
                Err(e) => {
                    warn!("Dropping malformed notification: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("PostgreSQL listener error: {}", e);
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_sanitized() {
        let tables = Tables::for_prefix("Room-Caches:eu");
        assert_eq!(tables.hash, "room_caches_eu_hash");
        assert_eq!(tables.channel, "room_caches_eu_events");

        assert_eq!(Tables::for_prefix("").queue, "roomcaches_queue");
    }
}
