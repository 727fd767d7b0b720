//! Session store keyed by (client IP, UA, uid, key path).
//!
//! Sessions slide: every successful admission that reuses one rewrites
//! the record with a fresh TTL and bumps `access_count`. A session is
//! only ever handed out when its stored IP and UA match the request
//! exactly; a mismatch drops the session for this request and never
//! mutates it.

use crate::redis::{RedisStore, StoreOp, StoreResult};
use hlsgate_core::config::GatewayConfig;
use hlsgate_core::{fingerprint, match_key};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Bound for the fallback session-key scan.
const SCAN_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uid: String,
    pub client_ip: String,
    pub user_agent: String,
    pub path: String,
    pub key_path: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub access_count: i64,
    pub session_type: String,
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn lookup_key(client_ip: &str, ua_hash: &str, uid: &str, key_path: &str) -> String {
    format!("ip_ua_session:{}:{}:{}:{}", client_ip, ua_hash, uid, key_path)
}

/// A session is valid for a request only when IP and UA match exactly.
fn record_matches(record: &SessionRecord, client_ip: &str, user_agent: &str) -> bool {
    record.client_ip == client_ip && record.user_agent == user_agent
}

#[derive(Clone)]
pub struct SessionStore {
    store: RedisStore,
}

impl SessionStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// C7: fetch a matching session (extending it), or create one when
    /// a uid is supplied. Returns `(session_id, is_new, effective_uid)`.
    pub async fn get_or_create(
        &self,
        config: &GatewayConfig,
        uid: Option<&str>,
        client_ip: &str,
        user_agent: &str,
        path: &str,
    ) -> StoreResult<(Option<String>, bool, Option<String>)> {
        let key_path = match_key::extract_match_key(path);
        if key_path.is_empty() {
            debug!(path, "No key path, session skipped");
            return Ok((None, false, None));
        }

        let ua_hash = fingerprint::ua_hash(user_agent);

        // Precise lookup when the uid is known
        if let Some(uid) = uid {
            let lookup = lookup_key(client_ip, &ua_hash, uid, &key_path);
            if let Some(session_id) = self.store.get(&lookup).await? {
                if let Some(mut record) = self.validate(&session_id, client_ip, user_agent).await?
                    && record.uid == uid
                    && record.key_path == key_path
                    && self.extend(config, &session_id, &mut record).await
                {
                    debug!(session_id = %session_id, uid, "Reusing session (precise)");
                    return Ok((Some(session_id), false, Some(uid.to_string())));
                }
            }
        }

        // Fallback: any session for this IP+UA+key_path (segments and
        // key files arrive without a uid)
        let pattern = format!("ip_ua_session:{}:{}:*:{}", client_ip, ua_hash, key_path);
        let keys = self.store.scan_keys(&pattern, SCAN_LIMIT).await?;

        let mut latest: Option<(String, SessionRecord)> = None;
        for key in keys {
            let Some(session_id) = self.store.get(&key).await? else {
                continue;
            };
            let Some(record) = self.validate(&session_id, client_ip, user_agent).await? else {
                continue;
            };
            if record.key_path != key_path {
                continue;
            }
            if latest.as_ref().is_none_or(|(_, r)| record.last_activity > r.last_activity) {
                latest = Some((session_id, record));
            }
        }

        if let Some((session_id, mut record)) = latest {
            let effective_uid = record.uid.clone();
            if self.extend(config, &session_id, &mut record).await {
                debug!(session_id = %session_id, uid = %effective_uid, "Reusing session (scan)");
                return Ok((Some(session_id), false, Some(effective_uid)));
            }
        }

        // Only create with a known uid
        let Some(uid) = uid else {
            return Ok((None, false, None));
        };

        let session_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let record = SessionRecord {
            uid: uid.to_string(),
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
            path: path.to_string(),
            key_path: key_path.clone(),
            created_at: now,
            last_activity: now,
            access_count: 1,
            session_type: "ip_ua_key_path_based".to_string(),
        };

        let ttl = config.session.session_ttl;
        let ops = vec![
            StoreOp::SetEx {
                key: session_key(&session_id),
                value: serde_json::to_string(&record)?,
                ttl,
            },
            StoreOp::SetEx {
                key: lookup_key(client_ip, &ua_hash, uid, &key_path),
                value: session_id.clone(),
                ttl,
            },
        ];
        let results = self.store.batch(&ops).await;

        if results.first().is_some_and(|r| r.is_some()) {
            debug!(session_id = %session_id, uid, key_path = %key_path, "Session created");
            Ok((Some(session_id), true, Some(uid.to_string())))
        } else {
            error!(session_id = %session_id, "Session creation failed");
            Ok((None, false, None))
        }
    }

    /// Load and validate a session against the requesting IP and UA.
    pub async fn validate(
        &self,
        session_id: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> StoreResult<Option<SessionRecord>> {
        let Some(raw) = self.store.get(&session_key(session_id)).await? else {
            debug!(session_id, "Session not found");
            return Ok(None);
        };
        let Ok(record) = serde_json::from_str::<SessionRecord>(&raw) else {
            return Ok(None);
        };

        if !record_matches(&record, client_ip, user_agent) {
            warn!(session_id, "Session IP/UA mismatch");
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Slide the session TTL and bump the activity counters.
    async fn extend(&self, config: &GatewayConfig, session_id: &str, record: &mut SessionRecord) -> bool {
        record.last_activity = chrono::Utc::now().timestamp();
        record.access_count += 1;

        let Ok(value) = serde_json::to_string(record) else {
            return false;
        };

        let ops = vec![
            StoreOp::SetEx {
                key: session_key(session_id),
                value,
                ttl: config.session.session_ttl,
            },
            StoreOp::Expire {
                key: format!("user_active_session:{}:{}", record.uid, record.client_ip),
                ttl: config.session.user_session_ttl,
            },
        ];
        let results = self.store.batch(&ops).await;
        results.first().is_some_and(|r| r.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            uid: "315".into(),
            client_ip: "203.0.113.9".into(),
            user_agent: "Mozilla/5.0".into(),
            path: "video/2025-08-30/xyz/720p/index.m3u8".into(),
            key_path: "xyz".into(),
            created_at: 100,
            last_activity: 100,
            access_count: 1,
            session_type: "ip_ua_key_path_based".into(),
        }
    }

    #[test]
    fn record_round_trips() {
        let raw = serde_json::to_string(&record()).unwrap();
        let decoded: SessionRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.uid, "315");
        assert_eq!(decoded.key_path, "xyz");
    }

    #[test]
    fn validation_requires_exact_ip_and_ua() {
        let r = record();
        assert!(record_matches(&r, "203.0.113.9", "Mozilla/5.0"));
        assert!(!record_matches(&r, "203.0.113.10", "Mozilla/5.0"));
        assert!(!record_matches(&r, "203.0.113.9", "curl/8.0"));
    }

    #[test]
    fn key_formats() {
        assert_eq!(session_key("abc"), "session:abc");
        assert_eq!(
            lookup_key("203.0.113.9", "aabbccdd", "315", "xyz"),
            "ip_ua_session:203.0.113.9:aabbccdd:315:xyz"
        );
    }
}
