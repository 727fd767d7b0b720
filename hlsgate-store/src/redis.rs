//! Redis connection façade.
//!
//! Wraps a multiplexed [`ConnectionManager`] (auto-reconnect) and adds
//! the batched-operation primitive used by the stores: a sequence of
//! [`StoreOp`]s executes through one pipeline when pipelining is
//! enabled and the batch has more than one op, and degrades to
//! individual commands (with per-op `None` on failure) otherwise.
//!
//! Store failures must never surface as 5xx. Admission call sites
//! treat every error here as a signal to degrade open and mark the
//! decision `fallback=true`.

use hlsgate_core::error::GateError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, info};

pub type StoreResult<T> = Result<T, GateError>;

fn store_err(e: redis::RedisError) -> GateError {
    GateError::Store(e.to_string())
}

/// A single primitive operation for [`RedisStore::batch`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    Get { key: String },
    Set { key: String, value: String },
    SetEx { key: String, value: String, ttl: i64 },
    SetNx { key: String, value: String },
    SetExNx { key: String, value: String, ttl: i64 },
    Expire { key: String, ttl: i64 },
    Ttl { key: String },
    Incr { key: String },
    Del { key: String },
}

fn build_cmd(op: &StoreOp) -> redis::Cmd {
    let mut cmd;
    match op {
        StoreOp::Get { key } => {
            cmd = redis::cmd("GET");
            cmd.arg(key);
        }
        StoreOp::Set { key, value } => {
            cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
        }
        StoreOp::SetEx { key, value, ttl } => {
            cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("EX").arg(ttl);
        }
        StoreOp::SetNx { key, value } => {
            cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
        }
        StoreOp::SetExNx { key, value, ttl } => {
            cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("EX").arg(ttl).arg("NX");
        }
        StoreOp::Expire { key, ttl } => {
            cmd = redis::cmd("EXPIRE");
            cmd.arg(key).arg(ttl);
        }
        StoreOp::Ttl { key } => {
            cmd = redis::cmd("TTL");
            cmd.arg(key);
        }
        StoreOp::Incr { key } => {
            cmd = redis::cmd("INCR");
            cmd.arg(key);
        }
        StoreOp::Del { key } => {
            cmd = redis::cmd("DEL");
            cmd.arg(key);
        }
    }
    cmd
}

/// Pooled async access to Redis. Cheap to clone; all clones share the
/// underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    pipeline_enabled: bool,
}

impl RedisStore {
    /// Connect and verify with a PING.
    pub async fn connect(url: &str, pipeline_enabled: bool) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client).await.map_err(store_err)?;
        let store = Self { manager, pipeline_enabled };
        store.ping().await?;
        info!("Connected to Redis");
        Ok(store)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut con = self.manager.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut con)
            .await
            .map_err(store_err)
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.manager.clone();
        con.get(key).await.map_err(store_err)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: i64) -> StoreResult<()> {
        let mut con = self.manager.clone();
        con.set_ex(key, value, ttl.max(0) as u64).await.map_err(store_err)
    }

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut con = self.manager.clone();
        con.incr(key, 1i64).await.map_err(store_err)
    }

    pub async fn expire(&self, key: &str, ttl: i64) -> StoreResult<bool> {
        let mut con = self.manager.clone();
        con.expire(key, ttl).await.map_err(store_err)
    }

    /// TTL in seconds; -1 = no expiry, -2 = missing key.
    pub async fn ttl(&self, key: &str) -> StoreResult<i64> {
        let mut con = self.manager.clone();
        con.ttl(key).await.map_err(store_err)
    }

    pub async fn del(&self, key: &str) -> StoreResult<i64> {
        let mut con = self.manager.clone();
        con.del(key).await.map_err(store_err)
    }

    pub async fn del_many(&self, keys: &[String]) -> StoreResult<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.manager.clone();
        con.del(keys).await.map_err(store_err)
    }

    /// Enumerate keys matching `pattern` via incremental SCAN, bounded
    /// to `max` results. Never KEYS: large keyspaces must not block
    /// the server.
    pub async fn scan_keys(&self, pattern: &str, max: usize) -> StoreResult<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> =
            con.scan_match(pattern).await.map_err(store_err)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
            if keys.len() >= max {
                break;
            }
        }
        Ok(keys)
    }

    // ── List ops (log rings) ──────────────────────────────────────

    /// LPUSH + LTRIM to `cap` + EXPIRE, as one pipeline.
    pub async fn lpush_capped(&self, key: &str, value: &str, cap: usize, ttl: i64) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.lpush(key, value).ignore();
        pipe.ltrim(key, 0, cap as isize - 1).ignore();
        pipe.expire(key, ttl).ignore();
        pipe.query_async::<()>(&mut con).await.map_err(store_err)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut con = self.manager.clone();
        con.lrange(key, start, stop).await.map_err(store_err)
    }

    pub async fn llen(&self, key: &str) -> StoreResult<i64> {
        let mut con = self.manager.clone();
        con.llen(key).await.map_err(store_err)
    }

    // ── Sorted-set ops (JS-whitelist directory index) ─────────────

    pub async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut con = self.manager.clone();
        con.zadd(key, member, score).await.map_err(store_err)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        con.zrem(key, member).await.map_err(store_err)
    }

    pub async fn zcard(&self, key: &str) -> StoreResult<i64> {
        let mut con = self.manager.clone();
        con.zcard(key).await.map_err(store_err)
    }

    pub async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut con = self.manager.clone();
        con.zscore(key, member).await.map_err(store_err)
    }

    /// The oldest member (lowest score), if any.
    pub async fn zrange_first(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.manager.clone();
        let members: Vec<String> = con.zrange(key, 0, 0).await.map_err(store_err)?;
        Ok(members.into_iter().next())
    }

    // ── Batched ops ───────────────────────────────────────────────

    /// Execute a sequence of operations, via one pipeline when enabled
    /// and the batch is larger than one. Per-op failures yield `None`
    /// in the result slot rather than failing the batch.
    pub async fn batch(&self, ops: &[StoreOp]) -> Vec<Option<redis::Value>> {
        if !self.pipeline_enabled || ops.len() <= 1 {
            return self.execute_individually(ops).await;
        }

        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for op in ops {
            pipe.add_command(build_cmd(op));
        }
        match pipe.query_async::<Vec<redis::Value>>(&mut con).await {
            Ok(values) => values.into_iter().map(Some).collect(),
            Err(e) => {
                error!(error = %e, "Pipeline failed, retrying ops individually");
                self.execute_individually(ops).await
            }
        }
    }

    async fn execute_individually(&self, ops: &[StoreOp]) -> Vec<Option<redis::Value>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let mut con = self.manager.clone();
            match build_cmd(op).query_async::<redis::Value>(&mut con).await {
                Ok(v) => results.push(Some(v)),
                Err(e) => {
                    error!(error = %e, op = ?op, "Store op failed");
                    results.push(None);
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &redis::Cmd) -> Vec<Vec<u8>> {
        cmd.args_iter()
            .map(|a| match a {
                redis::Arg::Simple(bytes) => bytes.to_vec(),
                redis::Arg::Cursor => b"<cursor>".to_vec(),
            })
            .collect()
    }

    #[test]
    fn set_ex_nx_builds_full_command() {
        let cmd = build_cmd(&StoreOp::SetExNx {
            key: "k".into(),
            value: "v".into(),
            ttl: 60,
        });
        let args = args_of(&cmd);
        assert_eq!(args[0], b"SET");
        assert_eq!(args[1], b"k");
        assert_eq!(args[2], b"v");
        assert_eq!(args[3], b"EX");
        assert_eq!(args[4], b"60");
        assert_eq!(args[5], b"NX");
    }

    #[test]
    fn incr_and_ttl_commands() {
        assert_eq!(args_of(&build_cmd(&StoreOp::Incr { key: "c".into() }))[0], b"INCR");
        assert_eq!(args_of(&build_cmd(&StoreOp::Ttl { key: "c".into() }))[0], b"TTL");
    }

    #[test]
    fn expire_carries_ttl_argument() {
        let args = args_of(&build_cmd(&StoreOp::Expire { key: "k".into(), ttl: 9600 }));
        assert_eq!(args, vec![b"EXPIRE".to_vec(), b"k".to_vec(), b"9600".to_vec()]);
    }
}
