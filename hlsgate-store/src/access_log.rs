//! Bounded access-log rings in Redis.
//!
//! Four rings: admitted, denied (cap 100), token-replay and key-access
//! events (cap 300), all LPUSH + LTRIM with a 7-day TTL. Hot-path
//! submission is a non-blocking enqueue into a bounded channel drained
//! by one writer task; a saturated queue drops the record rather than
//! blocking the request.

use crate::redis::RedisStore;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub const ACCESS_LOG_RECENT_KEY: &str = "access_log:recent";
pub const ACCESS_LOG_DENIED_KEY: &str = "access_log:denied";
pub const ACCESS_LOG_CAP: usize = 100;

/// 7 days, shared by every ring.
pub const LOG_TTL: i64 = 7 * 24 * 60 * 60;

const QUEUE_CAPACITY: usize = 10_000;

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug)]
struct LogJob {
    ring: String,
    record: String,
    cap: usize,
}

/// Handle for enqueuing log records. Cheap to clone.
#[derive(Clone)]
pub struct LogWriter {
    sender: mpsc::Sender<LogJob>,
}

impl LogWriter {
    /// Spawn the writer task and return the submission handle.
    pub fn spawn(store: RedisStore) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogJob>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = store.lpush_capped(&job.ring, &job.record, job.cap, LOG_TTL).await {
                    error!(error = %e, ring = %job.ring, "Log ring write failed");
                }
            }
        });
        Self { sender: tx }
    }

    /// Non-blocking enqueue; a full queue drops the record.
    pub fn push(&self, ring: &str, record: serde_json::Value, cap: usize) {
        let job = LogJob {
            ring: ring.to_string(),
            record: record.to_string(),
            cap,
        };
        if self.sender.try_send(job).is_err() {
            debug!(ring, "Log queue saturated, record dropped");
        }
    }

    /// Record an admission outcome into the recent/denied ring.
    pub fn log_access(
        &self,
        uid: Option<&str>,
        ip: &str,
        user_agent: &str,
        path: &str,
        allowed: bool,
        reason: Option<&str>,
        fallback: bool,
    ) {
        let mut record = json!({
            "uid": uid.unwrap_or("unknown"),
            "ip": ip,
            "ua": truncate_chars(user_agent, 200),
            "path": path,
            "timestamp": chrono::Utc::now().timestamp(),
            "allowed": allowed,
        });
        if let Some(reason) = reason
            && !allowed
        {
            record["reason"] = json!(reason);
        }
        if fallback {
            record["fallback"] = json!(true);
        }

        let ring = if allowed { ACCESS_LOG_RECENT_KEY } else { ACCESS_LOG_DENIED_KEY };
        self.push(ring, record, ACCESS_LOG_CAP);
    }
}

/// Read a ring's records, newest first, tolerating bad entries.
pub async fn read_ring(store: &RedisStore, ring: &str, limit: usize) -> Vec<serde_json::Value> {
    let raw = match store.lrange(ring, 0, limit as isize - 1).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, ring, "Log ring read failed");
            return vec![];
        }
    };
    raw.iter()
        .filter_map(|r| serde_json::from_str(r).ok())
        .collect()
}

pub async fn denied_logs(store: &RedisStore, limit: usize) -> Vec<serde_json::Value> {
    read_ring(store, ACCESS_LOG_DENIED_KEY, limit.min(ACCESS_LOG_CAP)).await
}

pub async fn recent_logs(store: &RedisStore, limit: usize) -> Vec<serde_json::Value> {
    read_ring(store, ACCESS_LOG_RECENT_KEY, limit.min(ACCESS_LOG_CAP)).await
}

pub async fn summary(store: &RedisStore) -> serde_json::Value {
    let denied = store.llen(ACCESS_LOG_DENIED_KEY).await.unwrap_or(0);
    let recent = store.llen(ACCESS_LOG_RECENT_KEY).await.unwrap_or(0);
    json!({
        "denied_count": denied,
        "recent_count": recent,
        "max_records": ACCESS_LOG_CAP,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("日本語テスト", 2), "日本");
        assert_eq!(truncate_chars("short", 200), "short");
    }

    #[test]
    fn ring_constants() {
        assert_eq!(ACCESS_LOG_CAP, 100);
        assert_eq!(LOG_TTL, 604_800);
    }
}
