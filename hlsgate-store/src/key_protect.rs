//! Key-file access counter and manifest content cache.
//!
//! The counter follows the replay discipline (INCR, TTL on first use,
//! deny past the limit, degrade open on store failure) but is keyed by
//! (token, uid, key path) in its own namespace with independent
//! limits. Logging is sparse: only abnormal events (invalid HMAC,
//! limit exceeded, fallback) are recorded, keeping the signal usable.

use crate::access_log::{truncate_chars, LogWriter};
use crate::redis::{RedisStore, StoreResult};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const KEY_PROTECT_LOG_KEY: &str = "key_protect:logs";
pub const KEY_PROTECT_LOG_CAP: usize = 300;

const M3U8_CACHE_PREFIX: &str = "m3u8_content:";

fn access_key(token: &str, uid: &str, key_path: &str) -> String {
    let digest = hex::encode(Sha256::digest(format!("{}:{}:{}", token, uid, key_path).as_bytes()));
    format!("key_protect:access:{}", &digest[..32])
}

fn cache_key(path: &str) -> String {
    let digest = hex::encode(Sha256::digest(path.as_bytes()));
    format!("{}{}", M3U8_CACHE_PREFIX, &digest[..32])
}

#[derive(Clone)]
pub struct KeyProtectStore {
    store: RedisStore,
    logs: LogWriter,
}

impl KeyProtectStore {
    pub fn new(store: RedisStore, logs: LogWriter) -> Self {
        Self { store, logs }
    }

    /// C9 check. Returns `(allowed, info)`; degrades open on store
    /// failure with the fallback logged.
    pub async fn check_access(
        &self,
        key_path: &str,
        uid: &str,
        token: &str,
        client_ip: &str,
        max_uses: i64,
        ttl: i64,
        user_agent: Option<&str>,
    ) -> (bool, serde_json::Value) {
        match self
            .check_inner(key_path, uid, token, client_ip, max_uses, ttl, user_agent)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, uid, key_path, "Key access check degraded open");
                self.log_event(uid, key_path, client_ip, true, 0, max_uses, Some("fallback"), user_agent);
                (true, json!({ "allowed": true, "error": e.to_string(), "fallback": true }))
            }
        }
    }

    async fn check_inner(
        &self,
        key_path: &str,
        uid: &str,
        token: &str,
        client_ip: &str,
        max_uses: i64,
        ttl: i64,
        user_agent: Option<&str>,
    ) -> StoreResult<(bool, serde_json::Value)> {
        let key = access_key(token, uid, key_path);
        let count = self.store.incr(&key).await?;

        if count == 1 {
            self.store.expire(&key, ttl).await?;
            debug!(uid, key_path, ip = client_ip, max_uses, "Key file first access");
            return Ok((
                true,
                json!({
                    "allowed": true,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": max_uses - count,
                    "is_first_use": true,
                    "uid": uid,
                }),
            ));
        }

        if count <= max_uses {
            let mut remaining_ttl = self.store.ttl(&key).await?;
            if remaining_ttl == -1 {
                self.store.expire(&key, ttl).await?;
                remaining_ttl = ttl;
            }
            Ok((
                true,
                json!({
                    "allowed": true,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": max_uses - count,
                    "is_first_use": false,
                    "uid": uid,
                    "remaining_ttl": remaining_ttl,
                }),
            ))
        } else {
            let remaining_ttl = self.store.ttl(&key).await?;
            warn!(uid, key_path, count, max_uses, ip = client_ip, "Key file replay blocked");
            self.log_event(
                uid,
                key_path,
                client_ip,
                true,
                count,
                max_uses,
                Some("max_uses_exceeded"),
                user_agent,
            );
            Ok((
                false,
                json!({
                    "allowed": false,
                    "current_count": count,
                    "max_uses": max_uses,
                    "remaining_uses": 0,
                    "exceeded": true,
                    "uid": uid,
                    "remaining_ttl": remaining_ttl,
                    "reason": "Key file replay detected: maximum usage count exceeded",
                }),
            ))
        }
    }

    /// Record an abnormal key-access event (hmac_invalid,
    /// max_uses_exceeded, fallback).
    #[allow(clippy::too_many_arguments)]
    pub fn log_event(
        &self,
        uid: &str,
        key_path: &str,
        client_ip: &str,
        blocked: bool,
        count: i64,
        max_uses: i64,
        reason: Option<&str>,
        user_agent: Option<&str>,
    ) {
        let record = json!({
            "type": "key_access",
            "uid": uid,
            "path": key_path,
            "ip": client_ip,
            "ua": user_agent.map(|ua| truncate_chars(ua, 200)),
            "count": count,
            "max_uses": max_uses,
            "blocked": blocked,
            "reason": reason,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        self.logs.push(KEY_PROTECT_LOG_KEY, record, KEY_PROTECT_LOG_CAP);
    }

    // ── Manifest read-through cache ───────────────────────────────

    pub async fn cached_manifest(&self, path: &str) -> StoreResult<Option<String>> {
        let content = self.store.get(&cache_key(path)).await?;
        if content.is_some() {
            debug!(path, "Manifest cache hit");
        }
        Ok(content)
    }

    pub async fn cache_manifest(&self, path: &str, content: &str, ttl: i64) -> StoreResult<()> {
        self.store.set_ex(&cache_key(path), content, ttl).await?;
        debug!(path, ttl, size = content.len(), "Manifest cached");
        Ok(())
    }

    /// SCAN-bounded cache statistics: up to 100 keys counted, up to 20
    /// detailed with TTL.
    pub async fn cache_stats(&self) -> serde_json::Value {
        let pattern = format!("{}*", M3U8_CACHE_PREFIX);
        let keys = match self.store.scan_keys(&pattern, 100).await {
            Ok(keys) => keys,
            Err(e) => {
                return json!({
                    "status": "error",
                    "error": e.to_string(),
                    "cache_count": 0,
                    "cache_details": [],
                    "timestamp": chrono::Utc::now().timestamp(),
                });
            }
        };

        let mut details = Vec::new();
        for key in keys.iter().take(20) {
            if let Ok(ttl) = self.store.ttl(key).await {
                details.push(json!({
                    "key_hash": key.trim_start_matches(M3U8_CACHE_PREFIX),
                    "ttl": ttl,
                }));
            }
        }

        json!({
            "status": "ok",
            "cache_count": keys.len(),
            "cache_details": details,
            "max_displayed": 20,
            "timestamp": chrono::Utc::now().timestamp(),
        })
    }
}

/// Key-access log records, newest first.
pub async fn logs(store: &RedisStore, limit: usize) -> Vec<serde_json::Value> {
    crate::access_log::read_ring(store, KEY_PROTECT_LOG_KEY, limit.min(KEY_PROTECT_LOG_CAP)).await
}

pub async fn summary(store: &RedisStore) -> serde_json::Value {
    let total = store.llen(KEY_PROTECT_LOG_KEY).await.unwrap_or(0);
    let recent = crate::access_log::read_ring(store, KEY_PROTECT_LOG_KEY, 100).await;
    let blocked = recent
        .iter()
        .filter(|r| r.get("blocked").and_then(|b| b.as_bool()).unwrap_or(false))
        .count();
    let max_exceeded = recent
        .iter()
        .filter(|r| r.get("reason").and_then(|v| v.as_str()) == Some("max_uses_exceeded"))
        .count();
    json!({
        "total_count": total,
        "recent_blocked_count": blocked,
        "recent_max_exceeded_count": max_exceeded,
        "max_records": KEY_PROTECT_LOG_CAP,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_key_shape() {
        let key = access_key("tok", "315", "video/a/enc.key");
        assert!(key.starts_with("key_protect:access:"));
        assert_eq!(key.len(), "key_protect:access:".len() + 32);
    }

    #[test]
    fn access_key_is_disjoint_from_replay_namespace() {
        // Incrementing this counter can never touch the replay counter
        let key = access_key("tok", "315", "p");
        assert!(!key.starts_with("token_replay:"));
    }

    #[test]
    fn access_key_varies_with_each_component() {
        let base = access_key("t", "u", "k");
        assert_ne!(base, access_key("t2", "u", "k"));
        assert_ne!(base, access_key("t", "u2", "k"));
        assert_ne!(base, access_key("t", "u", "k2"));
    }

    #[test]
    fn cache_key_is_path_hash_prefix() {
        let key = cache_key("video/2025-08-30/xyz/720p/index.m3u8");
        assert!(key.starts_with("m3u8_content:"));
        assert_eq!(key.len(), "m3u8_content:".len() + 32);
        // Stable for the same path
        assert_eq!(key, cache_key("video/2025-08-30/xyz/720p/index.m3u8"));
    }
}
