//! IP/CIDR whitelist store.
//!
//! Whitelist records are keyed by (normalized IP pattern, UA hash) and
//! carry a FIFO-bounded list of permitted key paths. A per-UID index
//! bounds how many (pattern, UA) pairs one uid may hold; overflow
//! evicts the oldest pair and deletes its record. The static-file
//! whitelist is the same shape minus paths. The adaptive manifest
//! access counter lives here as well since admission consults it in
//! the same breath as the whitelist.

use crate::redis::{RedisStore, StoreResult};
use hlsgate_core::config::GatewayConfig;
use hlsgate_core::{browser, cidr, fingerprint, match_key};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Bound for whitelist record enumeration per UA hash.
const SCAN_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEntry {
    pub key_path: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistRecord {
    pub uid: String,
    /// Most recently added key path (kept alongside `paths` for
    /// readers of the single-path era).
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub paths: Vec<PathEntry>,
    #[serde(default)]
    pub ip_patterns: Vec<String>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticWhitelistRecord {
    pub uid: String,
    #[serde(default)]
    pub ip_patterns: Vec<String>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub access_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UaIpPair {
    pub pair_id: String,
    pub ip_pattern: String,
    pub ua_hash: String,
    pub created_at: i64,
    pub last_updated: i64,
}

fn cidr_key(pattern: &str, ua_hash: &str) -> String {
    format!("ip_cidr_access:{}:{}", pattern.replace('/', "_"), ua_hash)
}

fn static_key(pattern: &str, ua_hash: &str) -> String {
    format!("static_file_access:{}:{}", pattern.replace('/', "_"), ua_hash)
}

fn uid_pairs_key(uid: &str) -> String {
    format!("uid_ua_ip_pairs:{}", uid)
}

fn uid_static_pairs_key(uid: &str) -> String {
    format!("uid_static_ua_ip_pairs:{}", uid)
}

/// Append or refresh `key_path`, enforcing the FIFO cap.
/// Returns (kept, removed) ordered by `created_at`.
pub(crate) fn merge_path_entries(
    mut entries: Vec<PathEntry>,
    key_path: &str,
    now: i64,
    cap: usize,
) -> (Vec<PathEntry>, Vec<PathEntry>) {
    if let Some(existing) = entries.iter_mut().find(|e| e.key_path == key_path) {
        existing.created_at = now;
        return (entries, vec![]);
    }

    entries.push(PathEntry { key_path: key_path.to_string(), created_at: now });
    if entries.len() <= cap {
        return (entries, vec![]);
    }

    entries.sort_by_key(|e| e.created_at);
    let removed = entries.drain(..entries.len() - cap).collect();
    (entries, removed)
}

/// Append or refresh a (pattern, UA) pair, enforcing the per-UID cap.
/// Returns (kept, removed).
pub(crate) fn merge_ua_ip_pairs(
    mut pairs: Vec<UaIpPair>,
    pattern: &str,
    ua_hash: &str,
    now: i64,
    cap: usize,
) -> (Vec<UaIpPair>, Vec<UaIpPair>) {
    let pair_id = format!("{}:{}", pattern, ua_hash);

    if let Some(existing) = pairs.iter_mut().find(|p| p.pair_id == pair_id) {
        existing.last_updated = now;
        return (pairs, vec![]);
    }

    pairs.push(UaIpPair {
        pair_id,
        ip_pattern: pattern.to_string(),
        ua_hash: ua_hash.to_string(),
        created_at: now,
        last_updated: now,
    });
    if pairs.len() <= cap {
        return (pairs, vec![]);
    }

    pairs.sort_by_key(|p| p.created_at);
    let removed = pairs.drain(..pairs.len() - cap).collect();
    (pairs, removed)
}

#[derive(Clone)]
pub struct WhitelistStore {
    store: RedisStore,
}

impl WhitelistStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// C6 check: is `client_ip` allowed to fetch `path` under this UA?
    ///
    /// Returns `(allowed, uid)`. The fixed-IP whitelist is handled by
    /// the validation coordinator before this runs.
    pub async fn check(
        &self,
        config: &GatewayConfig,
        client_ip: &str,
        path: &str,
        user_agent: &str,
    ) -> StoreResult<(bool, Option<String>)> {
        let is_static = config.is_static_file(path);
        let skip_path_check = is_static && config.whitelist.enable_static_file_ip_only_check;

        if skip_path_check {
            let (allowed, uid) = self.check_static_access(client_ip, user_agent).await?;
            if allowed {
                debug!(ip = client_ip, path, "Static-file whitelist hit");
                return Ok((true, uid));
            }
        }

        let requested_key = match_key::extract_match_key(path);
        if requested_key.is_empty() && !skip_path_check {
            debug!(path, "No match key in path");
            return Ok((false, None));
        }

        let ua_hash = fingerprint::ua_hash(user_agent);
        let pattern = format!("ip_cidr_access:*:{}", ua_hash);
        let keys = self.store.scan_keys(&pattern, SCAN_LIMIT).await?;

        let path_lower = path.to_lowercase();

        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<WhitelistRecord>(&raw) else {
                continue;
            };

            let (ip_match, matched) = cidr::match_patterns(client_ip, &record.ip_patterns);
            if !ip_match {
                continue;
            }

            if skip_path_check {
                debug!(ip = client_ip, pattern = %matched, uid = %record.uid, "IP+UA whitelist hit (static)");
                return Ok((true, Some(record.uid)));
            }

            let stored_key_path = if !record.paths.is_empty() {
                record
                    .paths
                    .iter()
                    .find(|p| p.key_path == requested_key)
                    .map(|p| p.key_path.clone())
            } else if record.key_path == requested_key {
                Some(record.key_path.clone())
            } else {
                None
            };

            if let Some(stored) = stored_key_path {
                // The stored key must also be a substring of the path
                if !path_lower.contains(&stored.to_lowercase()) {
                    warn!(ip = client_ip, path, allowed_key = %stored, "Key path not contained in request path");
                    return Ok((false, Some(record.uid)));
                }
                debug!(ip = client_ip, pattern = %matched, key_path = %stored, uid = %record.uid, "Whitelist hit");
                return Ok((true, Some(record.uid)));
            }
        }

        Ok((false, None))
    }

    /// Static-file whitelist probe: IP + UA only.
    pub async fn check_static_access(
        &self,
        client_ip: &str,
        user_agent: &str,
    ) -> StoreResult<(bool, Option<String>)> {
        let ua_hash = fingerprint::ua_hash(user_agent);
        let pattern = format!("static_file_access:*:{}", ua_hash);
        let keys = self.store.scan_keys(&pattern, SCAN_LIMIT).await?;

        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<StaticWhitelistRecord>(&raw) else {
                continue;
            };
            let (ip_match, _) = cidr::match_patterns(client_ip, &record.ip_patterns);
            if ip_match {
                return Ok((true, Some(record.uid)));
            }
        }

        Ok((false, None))
    }

    /// C6 add: upsert a whitelist record and maintain the UID index.
    /// Idempotent for the same (uid, pattern, UA, path).
    pub async fn add(
        &self,
        config: &GatewayConfig,
        uid: &str,
        path: &str,
        target_ip: &str,
        user_agent: &str,
    ) -> StoreResult<serde_json::Value> {
        let key_path = match_key::extract_match_key(path);
        if key_path.is_empty() {
            return Ok(json!({ "success": false, "error": "Invalid path format" }));
        }

        if !cidr::is_ip(target_ip) && !cidr::is_cidr(target_ip) {
            return Ok(json!({
                "success": false,
                "error": format!("Invalid IP address or CIDR: {}", target_ip),
            }));
        }
        let pattern = cidr::normalize(target_ip);

        let ua_hash = fingerprint::ua_hash(user_agent);
        let now = chrono::Utc::now().timestamp();
        let record_key = cidr_key(&pattern, &ua_hash);
        let ttl = config.whitelist.ip_access_ttl;

        // Merge into the existing record, if any
        let existing = match self.store.get(&record_key).await? {
            Some(raw) => serde_json::from_str::<WhitelistRecord>(&raw).ok(),
            None => None,
        };
        let merged_existing = existing.is_some();

        let entries = existing.as_ref().map(|r| r.paths.clone()).unwrap_or_default();
        let (paths, removed_paths) =
            merge_path_entries(entries, &key_path, now, config.whitelist.max_paths_per_cidr);

        for removed in &removed_paths {
            self.cleanup_path_counters(&removed.key_path).await;
        }

        let record = WhitelistRecord {
            uid: uid.to_string(),
            key_path: key_path.clone(),
            paths,
            ip_patterns: vec![pattern.clone()],
            user_agent: user_agent.to_string(),
            created_at: existing.map(|r| r.created_at).unwrap_or(now),
        };

        // Per-UID (pattern, UA) index with FIFO eviction
        let pairs_key = uid_pairs_key(uid);
        let pairs = match self.store.get(&pairs_key).await? {
            Some(raw) => serde_json::from_str::<Vec<UaIpPair>>(&raw).unwrap_or_default(),
            None => vec![],
        };
        let (pairs, removed_pairs) =
            merge_ua_ip_pairs(pairs, &pattern, &ua_hash, now, config.whitelist.max_ua_ip_pairs_per_uid);

        for old in &removed_pairs {
            if let Some((old_pattern, old_ua)) = old.pair_id.rsplit_once(':') {
                let old_key = cidr_key(old_pattern, old_ua);
                if let Err(e) = self.store.del(&old_key).await {
                    warn!(error = %e, pair = %old.pair_id, "Failed to delete evicted whitelist record");
                } else {
                    info!(uid, pair = %old.pair_id, "Evicted oldest UA+IP pair");
                }
            }
        }

        self.store
            .set_ex(&pairs_key, &serde_json::to_string(&pairs)?, ttl)
            .await?;
        self.store
            .set_ex(&record_key, &serde_json::to_string(&record)?, ttl)
            .await?;

        info!(uid, pattern = %pattern, ua_hash = %ua_hash, ttl, "Whitelist record stored");

        Ok(json!({
            "success": true,
            "message": "CIDR whitelist added/updated successfully",
            "key_path": key_path,
            "ip_pattern": pattern,
            "cidr_examples": cidr::examples(&pattern, 3),
            "ua_hash": ua_hash,
            "ttl": ttl,
            "patterns_merged": if merged_existing { 1 } else { 0 },
            "patterns_new": if merged_existing { 0 } else { 1 },
            "multi_path_info": {
                "max_paths_per_cidr": config.whitelist.max_paths_per_cidr,
                "current_path": record.key_path,
                "paths_removed": removed_paths.len(),
            },
            "uid_ua_ip_pairs_info": {
                "max_pairs_per_uid": config.whitelist.max_ua_ip_pairs_per_uid,
                "current_pairs_count": pairs.len(),
                "pairs_removed": removed_pairs.len(),
            },
        }))
    }

    /// Static-file whitelist upsert: no path, same FIFO index.
    pub async fn add_static(
        &self,
        config: &GatewayConfig,
        uid: &str,
        target_ip: &str,
        user_agent: &str,
    ) -> StoreResult<serde_json::Value> {
        if !cidr::is_ip(target_ip) && !cidr::is_cidr(target_ip) {
            return Ok(json!({
                "success": false,
                "error": format!("Invalid IP address or CIDR: {}", target_ip),
            }));
        }
        let pattern = cidr::normalize(target_ip);

        let ua_hash = fingerprint::ua_hash(user_agent);
        let now = chrono::Utc::now().timestamp();
        let ttl = config.whitelist.ip_access_ttl;

        let record = StaticWhitelistRecord {
            uid: uid.to_string(),
            ip_patterns: vec![pattern.clone()],
            user_agent: user_agent.to_string(),
            created_at: now,
            access_type: "static_files_only".to_string(),
        };

        let pairs_key = uid_static_pairs_key(uid);
        let pairs = match self.store.get(&pairs_key).await? {
            Some(raw) => serde_json::from_str::<Vec<UaIpPair>>(&raw).unwrap_or_default(),
            None => vec![],
        };
        let (pairs, removed_pairs) =
            merge_ua_ip_pairs(pairs, &pattern, &ua_hash, now, config.whitelist.max_ua_ip_pairs_per_uid);

        for old in &removed_pairs {
            if let Some((old_pattern, old_ua)) = old.pair_id.rsplit_once(':') {
                let old_key = static_key(old_pattern, old_ua);
                if let Err(e) = self.store.del(&old_key).await {
                    warn!(error = %e, pair = %old.pair_id, "Failed to delete evicted static record");
                }
            }
        }

        self.store
            .set_ex(&pairs_key, &serde_json::to_string(&pairs)?, ttl)
            .await?;
        self.store
            .set_ex(&static_key(&pattern, &ua_hash), &serde_json::to_string(&record)?, ttl)
            .await?;

        info!(uid, pattern = %pattern, ua_hash = %ua_hash, "Static-file whitelist stored");

        Ok(json!({
            "success": true,
            "message": "Static file whitelist added/updated successfully",
            "ip_pattern": pattern,
            "cidr_examples": cidr::examples(&pattern, 3),
            "ua_hash": ua_hash,
            "ttl": ttl,
            "uid_static_ua_ip_pairs_info": {
                "max_pairs_per_uid": config.whitelist.max_ua_ip_pairs_per_uid,
                "current_pairs_count": pairs.len(),
                "pairs_removed": removed_pairs.len(),
            },
        }))
    }

    /// Best-effort deletion of manifest counters tied to an evicted
    /// key path.
    async fn cleanup_path_counters(&self, key_path: &str) {
        let pattern = format!("m3u8_access_count_v2:*{}*", key_path);
        match self.store.scan_keys(&pattern, SCAN_LIMIT).await {
            Ok(keys) if !keys.is_empty() => {
                let count = keys.len();
                if let Err(e) = self.store.del_many(&keys).await {
                    warn!(error = %e, key_path, "Counter cleanup failed");
                } else {
                    info!(key_path, count, "Cleaned counters for evicted path");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, key_path, "Counter cleanup scan failed"),
        }
    }

    /// Adaptive manifest access counter: classify the UA, pick the
    /// per-class/per-browser limit and window, INCR, and deny past the
    /// limit.
    pub async fn check_m3u8_access(
        &self,
        config: &GatewayConfig,
        uid: &str,
        full_url: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> StoreResult<(bool, serde_json::Value)> {
        let (kind, name, suggested) = browser::detect(user_agent);

        let (max_count, window_ttl) = if config.m3u8.enable_browser_adaptive_access {
            let class_limits = config.m3u8.access_limits.get(kind.as_str());
            let max = class_limits
                .and_then(|m| m.get(&name).or_else(|| m.get("default")))
                .copied()
                .unwrap_or(suggested);
            let ttl = config.m3u8.access_window_ttl.get(kind.as_str()).copied().unwrap_or(60);
            (max as i64, ttl)
        } else {
            (config.m3u8.default_max_access_count as i64, config.m3u8.single_use_ttl)
        };

        let identifier = format!("{}:{}:{}", uid, full_url, client_ip);
        let hash = hex::encode(Sha256::digest(identifier.as_bytes()));
        let counter_key = format!("m3u8_access_count_v2:{}", hash);

        let count = self.store.incr(&counter_key).await?;
        if count == 1 {
            self.store.expire(&counter_key, window_ttl).await?;
            debug!(uid, browser = %name, "First manifest access in window");
            return Ok((
                true,
                json!({
                    "browser_type": kind.as_str(),
                    "browser_name": name,
                    "current_count": count,
                    "max_count": max_count,
                    "window_ttl": window_ttl,
                    "remaining_count": max_count - count,
                    "is_first_access": true,
                }),
            ));
        }

        let remaining_ttl = self.store.ttl(&counter_key).await?;
        if count <= max_count {
            Ok((
                true,
                json!({
                    "browser_type": kind.as_str(),
                    "browser_name": name,
                    "current_count": count,
                    "max_count": max_count,
                    "remaining_ttl": remaining_ttl,
                    "remaining_count": max_count - count,
                    "is_first_access": false,
                }),
            ))
        } else {
            warn!(uid, browser = %name, count, max_count, "Manifest access limit exceeded");
            Ok((
                false,
                json!({
                    "browser_type": kind.as_str(),
                    "browser_name": name,
                    "current_count": count,
                    "max_count": max_count,
                    "remaining_ttl": remaining_ttl,
                    "remaining_count": 0,
                    "is_first_access": false,
                    "exceeded": true,
                }),
            ))
        }
    }

    /// Summary counts for the monitoring surface.
    pub async fn info(&self) -> StoreResult<serde_json::Value> {
        let cidr_keys = self.store.scan_keys("ip_cidr_access:*", SCAN_LIMIT).await?;
        let static_keys = self.store.scan_keys("static_file_access:*", SCAN_LIMIT).await?;
        Ok(json!({
            "cidr_records": cidr_keys.len(),
            "static_records": static_keys.len(),
            "scan_limit": SCAN_LIMIT,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key_path: &str, created_at: i64) -> PathEntry {
        PathEntry { key_path: key_path.into(), created_at }
    }

    // ── merge_path_entries FIFO discipline ───────────────────────

    #[test]
    fn path_merge_appends_new_path() {
        let (kept, removed) = merge_path_entries(vec![entry("a", 1)], "b", 2, 3);
        assert_eq!(kept.len(), 2);
        assert!(removed.is_empty());
    }

    #[test]
    fn path_merge_refreshes_existing_timestamp() {
        let (kept, removed) = merge_path_entries(vec![entry("a", 1)], "a", 9, 3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].created_at, 9);
        assert!(removed.is_empty());
    }

    #[test]
    fn path_merge_evicts_oldest_beyond_cap() {
        let entries = vec![entry("a", 1), entry("b", 2), entry("c", 3)];
        let (kept, removed) = merge_path_entries(entries, "d", 4, 3);
        let kept_names: Vec<_> = kept.iter().map(|e| e.key_path.as_str()).collect();
        assert_eq!(kept_names, vec!["b", "c", "d"]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key_path, "a");
    }

    #[test]
    fn path_merge_eviction_is_by_created_at_not_insertion() {
        let entries = vec![entry("newish", 10), entry("oldest", 1), entry("mid", 5)];
        let (kept, removed) = merge_path_entries(entries, "fresh", 20, 3);
        assert_eq!(removed[0].key_path, "oldest");
        assert!(kept.iter().all(|e| e.key_path != "oldest"));
    }

    // ── merge_ua_ip_pairs ────────────────────────────────────────

    fn pair(id_pattern: &str, ua: &str, created: i64) -> UaIpPair {
        UaIpPair {
            pair_id: format!("{}:{}", id_pattern, ua),
            ip_pattern: id_pattern.into(),
            ua_hash: ua.into(),
            created_at: created,
            last_updated: created,
        }
    }

    #[test]
    fn pair_merge_keeps_newest_cap_entries() {
        let pairs = vec![
            pair("10.0.0.0/24", "aa", 1),
            pair("10.0.1.0/24", "aa", 2),
            pair("10.0.2.0/24", "aa", 3),
        ];
        let (kept, removed) = merge_ua_ip_pairs(pairs, "10.0.3.0/24", "aa", 4, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].ip_pattern, "10.0.0.0/24");
        // Remaining are the newest by created_at
        let created: Vec<_> = kept.iter().map(|p| p.created_at).collect();
        assert_eq!(created, vec![2, 3, 4]);
    }

    #[test]
    fn pair_merge_existing_pair_only_touches_last_updated() {
        let pairs = vec![pair("10.0.0.0/24", "aa", 1)];
        let (kept, removed) = merge_ua_ip_pairs(pairs, "10.0.0.0/24", "aa", 7, 3);
        assert_eq!(kept.len(), 1);
        assert!(removed.is_empty());
        assert_eq!(kept[0].created_at, 1);
        assert_eq!(kept[0].last_updated, 7);
    }

    #[test]
    fn pair_id_round_trips_through_rsplit() {
        // The evictor recovers (pattern, ua_hash) from pair_id; the
        // pattern itself contains ':' never, but IPv6 patterns do
        let p = pair("2001:db8::/32", "aa", 1);
        let (pattern, ua) = p.pair_id.rsplit_once(':').unwrap();
        assert_eq!(pattern, "2001:db8::/32");
        assert_eq!(ua, "aa");
    }

    // ── Record serde shapes ──────────────────────────────────────

    #[test]
    fn whitelist_record_round_trips() {
        let record = WhitelistRecord {
            uid: "315".into(),
            key_path: "xyz".into(),
            paths: vec![entry("xyz", 100)],
            ip_patterns: vec!["203.0.113.0/24".into()],
            user_agent: "Mozilla/5.0".into(),
            created_at: 100,
        };
        let raw = serde_json::to_string(&record).unwrap();
        let decoded: WhitelistRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.uid, "315");
        assert_eq!(decoded.paths[0].key_path, "xyz");
    }

    #[test]
    fn whitelist_record_tolerates_single_path_era_json() {
        // Records written before multi-path support carry no `paths`
        let raw = r#"{"uid":"7","key_path":"abc","ip_patterns":["10.0.0.0/24"]}"#;
        let decoded: WhitelistRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.key_path, "abc");
        assert!(decoded.paths.is_empty());
    }

    #[test]
    fn record_keys_escape_prefix_slashes() {
        assert_eq!(cidr_key("10.1.2.0/24", "aabbccdd"), "ip_cidr_access:10.1.2.0_24:aabbccdd");
        assert_eq!(static_key("10.1.2.0/24", "aabbccdd"), "static_file_access:10.1.2.0_24:aabbccdd");
    }
}
