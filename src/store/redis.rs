//! Redis / Valkey storage backend
//!
//! Records live in hashes, indexes in sets and sorted sets. A commit is one
//! Lua script so the guard check and every write run atomically on the
//! server. Ops are validated before the script is sent because Redis does
//! not roll back a script that fails halfway.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{storage, Result};
use crate::store::{
    CommitOutcome, Notification, NotificationStream, StoreBackend, Transaction, WriteOp,
};

mod scripts {
    use redis::Script;

    /// ARGV: guard mode, guard hash, guard id, expected body, then groups of
    /// four (op, key, member, value)
    pub fn guarded_commit() -> Script {
        Script::new(
            r#"
            local mode = ARGV[1]
            if mode ~= 'none' then
                local current = redis.call('HGET', ARGV[2], ARGV[3])
                if mode == 'absent' then
                    if current then return 0 end
                elseif current ~= ARGV[4] then
                    return 0
                end
            end

            local i = 5
            while i <= #ARGV do
                local op, key, member, value = ARGV[i], ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]
                if op == 'hset' then
                    redis.call('HSET', key, member, value)
                elseif op == 'hdel' then
                    redis.call('HDEL', key, member)
                elseif op == 'sadd' then
                    redis.call('SADD', key, member)
                elseif op == 'srem' then
                    redis.call('SREM', key, member)
                elseif op == 'zadd' then
                    redis.call('ZADD', key, value, member)
                elseif op == 'zrem' then
                    redis.call('ZREM', key, member)
                elseif op == 'zincrby' then
                    redis.call('ZINCRBY', key, value, member)
                end
                i = i + 4
            end
            return 1
            "#,
        )
    }
}

fn score_bound(value: f64) -> String {
    if value == f64::INFINITY {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        value.to_string()
    }
}

fn flatten(op: &WriteOp) -> [String; 4] {
    match op {
        WriteOp::HashSet { hash, id, value } => {
            ["hset".into(), hash.clone(), id.clone(), value.clone()]
        }
        WriteOp::HashDel { hash, id } => ["hdel".into(), hash.clone(), id.clone(), String::new()],
        WriteOp::SetAdd { key, member } => {
            ["sadd".into(), key.clone(), member.clone(), String::new()]
        }
        WriteOp::SetRem { key, member } => {
            ["srem".into(), key.clone(), member.clone(), String::new()]
        }
        WriteOp::SortedAdd { key, member, score } => {
            ["zadd".into(), key.clone(), member.clone(), score.to_string()]
        }
        WriteOp::SortedRem { key, member } => {
            ["zrem".into(), key.clone(), member.clone(), String::new()]
        }
        WriteOp::SortedIncr { key, member, delta } => {
            ["zincrby".into(), key.clone(), member.clone(), delta.to_string()]
        }
    }
}

/// Backend over a Redis-compatible server
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    commit_script: redis::Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis registry at {}", url);

        let client = redis::Client::open(url)
            .map_err(|e| storage(format!("Failed to create Redis client: {e}")))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| storage(format!("Failed to connect to Redis: {e}")))?;

        info!("Successfully connected to Redis registry");

        Ok(Self {
            client,
            conn,
            commit_script: scripts::guarded_commit(),
        })
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn fetch(&self, hash: &str, id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(hash, id)
            .await
            .map_err(|e| storage(format!("Redis HGET failed: {e}")))
    }

    async fn fetch_many(&self, hash: &str, ids: &[String]) -> Result<Vec<Option<String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("HMGET")
            .arg(hash)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| storage(format!("Redis HMGET failed: {e}")))
    }

    async fn fetch_all(&self, hash: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let mut entries: Vec<(String, String)> = conn
            .hgetall(hash)
            .await
            .map_err(|e| storage(format!("Redis HGETALL failed: {e}")))?;
        entries.sort();
        Ok(entries)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| storage(format!("Redis SMEMBERS failed: {e}")))?;
        members.sort();
        Ok(members)
    }

    async fn intersect(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn
            .sinter(keys)
            .await
            .map_err(|e| storage(format!("Redis SINTER failed: {e}")))?;
        members.sort();
        Ok(members)
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrangebyscore(key, score_bound(min), score_bound(max))
            .await
            .map_err(|e| storage(format!("Redis ZRANGEBYSCORE failed: {e}")))
    }

    async fn scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        conn.zrange_withscores(key, 0, -1)
            .await
            .map_err(|e| storage(format!("Redis ZRANGE failed: {e}")))
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        txn.validate()?;

        let mut invocation = self.commit_script.prepare_invoke();
        match &txn.guard {
            None => {
                invocation.arg("none").arg("").arg("").arg("");
            }
            Some(guard) => {
                let mode = if guard.expected.is_some() { "equals" } else { "absent" };
                invocation
                    .arg(mode)
                    .arg(&guard.hash)
                    .arg(&guard.id)
                    .arg(guard.expected.as_deref().unwrap_or(""));
            }
        }
        for op in &txn.ops {
            for part in flatten(op) {
                invocation.arg(part);
            }
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| storage(format!("Redis commit script failed: {e}")))?;

        if applied == 1 {
            Ok(CommitOutcome::Committed)
        } else {
            debug!("Redis commit guard conflict");
            Ok(CommitOutcome::Conflict)
        }
    }

    async fn push(&self, queue: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue, payload)
            .await
            .map_err(|e| storage(format!("Redis RPUSH failed: {e}")))
    }

    async fn drain(&self, queue: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let (entries,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(queue, 0, -1)
            .del(queue)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| storage(format!("Redis drain failed: {e}")))?;
        Ok(entries)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| storage(format!("Redis PUBLISH failed: {e}")))
    }

    async fn subscribe_prefix(&self, prefix: &str) -> Result<NotificationStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| storage(format!("Failed to open Redis pubsub connection: {e}")))?;
        pubsub
            .psubscribe(format!("{}*", prefix))
            .await
            .map_err(|e| storage(format!("Redis PSUBSCRIBE failed: {e}")))?;

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let topic = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(Notification { topic, payload }),
                Err(e) => {
                    warn!("Dropping undecodable message on {}: {}", topic, e);
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bounds() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(2.5), "2.5");
    }

    #[test]
    fn test_flatten_keeps_four_slots() {
        let op = WriteOp::SortedIncr {
            key: "rooms:processes:score".to_string(),
            member: "p1".to_string(),
            delta: -1.0,
        };
        assert_eq!(
            flatten(&op),
            ["zincrby", "rooms:processes:score", "p1", "-1"].map(String::from)
        );
    }
}
