//! JS-whitelist store: permissions written by front-end code under
//! HMAC signature, scoped to (uid, UA, IP, match key).
//!
//! Each (uid, UA, IP) keeps at most three match-key directories in a
//! sorted set ordered by creation time; overflow deletes the oldest
//! directory's record and index entry together. An empty `js_path`
//! produces a wildcard record that admits any static file for the
//! pair.

use crate::redis::{RedisStore, StoreResult};
use hlsgate_core::config::GatewayConfig;
use hlsgate_core::{fingerprint, match_key};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

const MAX_DIRS_PER_PAIR: i64 = 3;
const SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsWhitelistRecord {
    pub uid: String,
    pub js_path: String,
    pub match_key: String,
    pub client_ip: String,
    pub user_agent: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_wildcard: bool,
}

/// The one place the record key schema lives: writer, reader, and
/// evictor all build keys here.
fn record_key(uid: &str, match_key_hash: &str, ua_hash: &str, ip_hash: &str) -> String {
    format!("js_wl_frontend:{}:{}:{}:{}", uid, match_key_hash, ua_hash, ip_hash)
}

fn dirs_key(uid: &str, ua_hash: &str, ip_hash: &str) -> String {
    format!("js_wl_dirs:{}:{}:{}", uid, ua_hash, ip_hash)
}

#[derive(Clone)]
pub struct JsWhitelistStore {
    store: RedisStore,
}

impl JsWhitelistStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// Add a JS-whitelist entry. Empty `js_path` = wildcard mode.
    pub async fn add(
        &self,
        config: &GatewayConfig,
        uid: &str,
        js_path: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> StoreResult<serde_json::Value> {
        let ua_hash = fingerprint::ua_hash(user_agent);
        let ip_hash = fingerprint::ip_hash(client_ip);

        let mk = if js_path.is_empty() {
            String::new()
        } else {
            match_key::extract_match_key(js_path)
        };
        let mk_hash = fingerprint::match_key_hash(&mk);

        let now = chrono::Utc::now().timestamp();
        let ttl = config.js_whitelist.tracker_ttl;
        let dirs = dirs_key(uid, &ua_hash, &ip_hash);

        // FIFO over match-key directories for this (uid, UA, IP)
        let current = self.store.zcard(&dirs).await?;
        if current >= MAX_DIRS_PER_PAIR && self.store.zscore(&dirs, &mk_hash).await?.is_none() {
            if let Some(oldest) = self.store.zrange_first(&dirs).await? {
                self.store.del(&record_key(uid, &oldest, &ua_hash, &ip_hash)).await?;
                self.store.zrem(&dirs, &oldest).await?;
                info!(uid, evicted = %oldest, "JS whitelist directory cap reached, oldest evicted");
            }
        }

        self.store.zadd(&dirs, &mk_hash, now).await?;
        self.store.expire(&dirs, ttl).await?;

        let record = JsWhitelistRecord {
            uid: uid.to_string(),
            js_path: js_path.to_string(),
            match_key: mk.clone(),
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
            created_at: now,
            expires_at: now + ttl,
            is_wildcard: js_path.is_empty(),
        };
        self.store
            .set_ex(
                &record_key(uid, &mk_hash, &ua_hash, &ip_hash),
                &serde_json::to_string(&record)?,
                ttl,
            )
            .await?;

        info!(uid, wildcard = record.is_wildcard, match_key = %mk, ip = client_ip, ttl, "JS whitelist entry added");

        Ok(json!({
            "success": true,
            "message": "JS whitelist entry added successfully",
            "data": {
                "uid": uid,
                "js_path": js_path,
                "match_key": mk,
                "is_wildcard": record.is_wildcard,
                "client_ip": client_ip,
                "user_agent": user_agent,
                "ttl": ttl,
                "expires_at": record.expires_at,
            },
        }))
    }

    /// Check whether (uid?, UA, IP) may fetch `js_path`, honouring the
    /// wildcard record. Returns `(allowed, uid)`.
    pub async fn check(
        &self,
        js_path: &str,
        client_ip: &str,
        user_agent: &str,
        uid: Option<&str>,
    ) -> StoreResult<(bool, Option<String>)> {
        let ua_hash = fingerprint::ua_hash(user_agent);
        let ip_hash = fingerprint::ip_hash(client_ip);

        let mk = match_key::extract_match_key(js_path);
        let mk_hash = fingerprint::match_key_hash(&mk);
        let wildcard_hash = fingerprint::match_key_hash("");

        if let Some(uid) = uid {
            for hash in [&mk_hash, &wildcard_hash] {
                let key = record_key(uid, hash, &ua_hash, &ip_hash);
                if let Some(raw) = self.store.get(&key).await?
                    && serde_json::from_str::<JsWhitelistRecord>(&raw).is_ok()
                {
                    debug!(uid, path = js_path, wildcard = (*hash == wildcard_hash), "JS whitelist hit");
                    return Ok((true, Some(uid.to_string())));
                }
            }
            return Ok((false, None));
        }

        // No uid: search records for this (match key, UA, IP)
        for hash in [&mk_hash, &wildcard_hash] {
            let pattern = format!("js_wl_frontend:*:{}:{}:{}", hash, ua_hash, ip_hash);
            let keys = self.store.scan_keys(&pattern, SCAN_LIMIT).await?;
            if let Some(key) = keys.first()
                && let Some(raw) = self.store.get(key).await?
                && let Ok(record) = serde_json::from_str::<JsWhitelistRecord>(&raw)
            {
                debug!(uid = %record.uid, path = js_path, "JS whitelist hit (scan)");
                return Ok((true, Some(record.uid)));
            }
        }

        Ok((false, None))
    }

    /// All JS-whitelist entries for a uid, with remaining TTLs.
    pub async fn stats(&self, uid: &str) -> StoreResult<serde_json::Value> {
        let pattern = format!("js_wl_frontend:{}:*", uid);
        let keys = self.store.scan_keys(&pattern, SCAN_LIMIT).await?;

        let mut entries = Vec::new();
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                warn!(key = %key, "Unreadable JS whitelist record");
                continue;
            };
            if let Ok(ttl) = self.store.ttl(&key).await {
                value["remaining_ttl"] = json!(ttl);
            }
            entries.push(value);
        }

        Ok(json!({
            "enabled": true,
            "uid": uid,
            "total_entries": entries.len(),
            "entries": entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_schema_is_shared() {
        let key = record_key("315", "aaaaaaaaaaaa", "bbbbbbbb", "cccccccc");
        assert_eq!(key, "js_wl_frontend:315:aaaaaaaaaaaa:bbbbbbbb:cccccccc");
    }

    #[test]
    fn dirs_key_schema() {
        assert_eq!(dirs_key("315", "bb", "cc"), "js_wl_dirs:315:bb:cc");
    }

    #[test]
    fn wildcard_record_round_trips() {
        let record = JsWhitelistRecord {
            uid: "315".into(),
            js_path: String::new(),
            match_key: String::new(),
            client_ip: "203.0.113.9".into(),
            user_agent: "Mozilla/5.0".into(),
            created_at: 100,
            expires_at: 3700,
            is_wildcard: true,
        };
        let raw = serde_json::to_string(&record).unwrap();
        let decoded: JsWhitelistRecord = serde_json::from_str(&raw).unwrap();
        assert!(decoded.is_wildcard);
        assert!(decoded.js_path.is_empty());
    }

    #[test]
    fn dir_cap_constant() {
        assert_eq!(MAX_DIRS_PER_PAIR, 3);
    }
}
