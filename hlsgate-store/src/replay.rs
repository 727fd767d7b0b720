//! Token anti-replay counter.
//!
//! One counter per (token, uid, path): INCR, TTL on first use, denial
//! past `max_uses`. INCR-then-EXPIRE is not atomic; a later read that
//! finds no TTL repairs it. Store failures degrade open with
//! `fallback=true` so a Redis outage never blocks playback.

use crate::access_log::{truncate_chars, LogWriter};
use crate::redis::{RedisStore, StoreResult};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const REPLAY_LOG_KEY: &str = "token_replay:logs";
pub const REPLAY_LOG_CAP: usize = 300;

fn replay_key(token: &str, uid: &str, path: &str) -> String {
    let hash = hex::encode(Sha256::digest(format!("{}:{}:{}", token, uid, path).as_bytes()));
    format!("token_replay:{}", hash)
}

fn event_record(
    uid: &str,
    path: &str,
    full_url: Option<&str>,
    client_ip: &str,
    user_agent: Option<&str>,
    count: i64,
    max_uses: i64,
    blocked: bool,
) -> serde_json::Value {
    json!({
        "uid": uid,
        "path": path,
        "full_url": truncate_chars(full_url.unwrap_or(path), 500),
        "ip": client_ip,
        "ua": user_agent.map(|ua| truncate_chars(ua, 200)),
        "count": count,
        "max_uses": max_uses,
        "blocked": blocked,
        "timestamp": chrono::Utc::now().timestamp(),
    })
}

#[derive(Clone)]
pub struct ReplayStore {
    store: RedisStore,
    logs: LogWriter,
}

impl ReplayStore {
    pub fn new(store: RedisStore, logs: LogWriter) -> Self {
        Self { store, logs }
    }

    /// C8 check. Returns `(allowed, info)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn check(
        &self,
        token: &str,
        uid: &str,
        path: &str,
        max_uses: i64,
        ttl: i64,
        client_ip: &str,
        user_agent: Option<&str>,
        full_url: Option<&str>,
    ) -> (bool, serde_json::Value) {
        match self
            .check_inner(token, uid, path, max_uses, ttl, client_ip, user_agent, full_url)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, uid, path, "Replay check degraded open");
                (true, json!({ "allowed": true, "error": e.to_string(), "fallback": true }))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn check_inner(
        &self,
        token: &str,
        uid: &str,
        path: &str,
        max_uses: i64,
        ttl: i64,
        client_ip: &str,
        user_agent: Option<&str>,
        full_url: Option<&str>,
    ) -> StoreResult<(bool, serde_json::Value)> {
        let key = replay_key(token, uid, path);
        let count = self.store.incr(&key).await?;

        if count == 1 {
            self.store.expire(&key, ttl).await?;
            debug!(uid, path, max_uses, ttl, "Token first use");
            return Ok((
                true,
                json!({
                    "allowed": true,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": max_uses - count,
                    "is_first_use": true,
                    "ttl": ttl,
                }),
            ));
        }

        if count <= max_uses {
            let mut remaining_ttl = self.store.ttl(&key).await?;
            // EXPIRE can be lost between INCR and here; repair it
            if remaining_ttl == -1 {
                self.store.expire(&key, ttl).await?;
                remaining_ttl = ttl;
            }

            self.logs.push(
                REPLAY_LOG_KEY,
                event_record(uid, path, full_url, client_ip, user_agent, count, max_uses, false),
                REPLAY_LOG_CAP,
            );

            Ok((
                true,
                json!({
                    "allowed": true,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": max_uses - count,
                    "is_first_use": false,
                    "remaining_ttl": remaining_ttl,
                }),
            ))
        } else {
            let remaining_ttl = self.store.ttl(&key).await?;
            warn!(uid, path, count, max_uses, ip = client_ip, "Token replay blocked");

            self.logs.push(
                REPLAY_LOG_KEY,
                event_record(uid, path, full_url, client_ip, user_agent, count, max_uses, true),
                REPLAY_LOG_CAP,
            );

            Ok((
                false,
                json!({
                    "allowed": false,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": 0,
                    "is_first_use": false,
                    "remaining_ttl": remaining_ttl,
                    "exceeded": true,
                    "reason": "Token replay detected: maximum usage count exceeded",
                }),
            ))
        }
    }

    /// Read-only probe of a token's counter.
    pub async fn usage_info(&self, token: &str, uid: &str, path: &str) -> StoreResult<serde_json::Value> {
        let key = replay_key(token, uid, path);
        match self.store.get(&key).await? {
            None => Ok(json!({
                "exists": false,
                "current_count": 0,
                "message": "Token has not been used yet",
            })),
            Some(raw) => {
                let count = raw.parse::<i64>().unwrap_or(0);
                let remaining_ttl = self.store.ttl(&key).await?;
                Ok(json!({
                    "exists": true,
                    "current_count": count,
                    "remaining_ttl": remaining_ttl,
                }))
            }
        }
    }

    /// Manually invalidate a token's counter.
    pub async fn invalidate(&self, token: &str, uid: &str, path: &str) -> StoreResult<bool> {
        let deleted = self.store.del(&replay_key(token, uid, path)).await?;
        Ok(deleted > 0)
    }
}

/// Replay-event log records, newest first.
pub async fn logs(store: &RedisStore, limit: usize) -> Vec<serde_json::Value> {
    crate::access_log::read_ring(store, REPLAY_LOG_KEY, limit.min(REPLAY_LOG_CAP)).await
}

pub async fn summary(store: &RedisStore) -> serde_json::Value {
    let total = store.llen(REPLAY_LOG_KEY).await.unwrap_or(0);
    let recent = crate::access_log::read_ring(store, REPLAY_LOG_KEY, 100).await;
    let blocked = recent
        .iter()
        .filter(|r| r.get("blocked").and_then(|b| b.as_bool()).unwrap_or(false))
        .count();
    json!({
        "total_count": total,
        "recent_blocked_count": blocked,
        "max_records": REPLAY_LOG_CAP,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_key_is_scoped_by_token_uid_and_path() {
        let a = replay_key("t1", "u1", "p1");
        let b = replay_key("t1", "u1", "p2");
        let c = replay_key("t1", "u2", "p1");
        let d = replay_key("t2", "u1", "p1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("token_replay:"));
        // Full sha256 hex after the prefix
        assert_eq!(a.len(), "token_replay:".len() + 64);
    }

    #[test]
    fn replay_key_namespace_is_disjoint_from_key_protect() {
        // The generic counter and the key-file counter never share keys
        let generic = replay_key("tok", "uid", "video/a/enc.key");
        assert!(!generic.starts_with("key_protect:"));
    }

    #[test]
    fn event_record_truncates_wide_fields() {
        let long_url = "x".repeat(600);
        let long_ua = "u".repeat(300);
        let record = event_record("1", "p", Some(&long_url), "ip", Some(&long_ua), 2, 1, true);
        assert_eq!(record["full_url"].as_str().unwrap().len(), 500);
        assert_eq!(record["ua"].as_str().unwrap().len(), 200);
        assert_eq!(record["blocked"], json!(true));
    }

    #[test]
    fn event_record_falls_back_to_path_for_url() {
        let record = event_record("1", "p", None, "ip", None, 1, 1, false);
        assert_eq!(record["full_url"], json!("p"));
        assert!(record["ua"].is_null());
    }
}
