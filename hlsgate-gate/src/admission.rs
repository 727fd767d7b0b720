//! The per-request admission state machine.
//!
//! Strict order, short-circuiting: skip-all gate, validation fan-out,
//! JS-whitelist fallback, Safe-Key redirect, the strict manifest gate,
//! the token-replay gate, and the key-file gate. Fixed-whitelist
//! admissions bypass the manifest/replay/key gates; the Safe-Key
//! redirect still applies to them.

use crate::validate::ValidationCoordinator;
use hlsgate_core::config::GatewayConfig;
use hlsgate_core::token;
use hlsgate_store::access_log::LogWriter;
use hlsgate_store::js_whitelist::JsWhitelistStore;
use hlsgate_store::key_protect::KeyProtectStore;
use hlsgate_store::replay::ReplayStore;
use hlsgate_store::whitelist::WhitelistStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File classification driving MIME, cache policy, and gate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    M3u8,
    Ts,
    EncKey,
    Static,
    Default,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::M3u8 => "m3u8",
            FileType::Ts => "ts",
            FileType::EncKey => "enc_key",
            FileType::Static => "static",
            FileType::Default => "default",
        }
    }
}

/// Classify a request path by extension.
pub fn classify_file_type(path: &str) -> FileType {
    let lower = path.to_lowercase();
    if lower.ends_with(".m3u8") {
        FileType::M3u8
    } else if lower.ends_with(".ts") {
        FileType::Ts
    } else if lower.ends_with("enc.key") {
        FileType::EncKey
    } else if [".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".woff", ".woff2", ".ttf"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        FileType::Static
    } else {
        FileType::Default
    }
}

/// True for paths the JS-whitelist fallback may admit.
fn is_static_like(config: &GatewayConfig, path: &str) -> bool {
    let lower = path.to_lowercase();
    if config.is_static_file(path) {
        return true;
    }
    if [".m3u8", ".ts", "enc.key", ".jpg", ".png", ".gif", ".svg", ".ico"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        return true;
    }
    // Extension-less index files (index / playlist / master)
    lower
        .rsplit('/')
        .next()
        .is_some_and(|name| matches!(name, "index" | "playlist" | "master"))
}

/// Everything the pipeline needs to know about one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Request path without a leading slash (token canonical form)
    pub path: &'a str,
    pub full_url: &'a str,
    /// Canonicalized client IP
    pub client_ip: &'a str,
    pub user_agent: &'a str,
    pub uid: Option<&'a str>,
    pub expires: Option<&'a str>,
    pub token: Option<&'a str>,
}

/// A granted admission, carried into delivery.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub effective_uid: Option<String>,
    pub session_id: Option<String>,
    pub new_session: bool,
    pub is_protected_key: bool,
    pub skip_validation: bool,
    /// Some check degraded open; the access log marks the decision
    pub fallback: bool,
}

#[derive(Debug)]
pub enum Decision {
    Allow(Admission),
    Redirect { location: String },
    Deny { status: u16, body: String },
}

pub struct AdmissionPipeline {
    coordinator: Arc<ValidationCoordinator>,
    whitelist: WhitelistStore,
    js_whitelist: JsWhitelistStore,
    replay: ReplayStore,
    key_protect: KeyProtectStore,
    logs: LogWriter,
}

impl AdmissionPipeline {
    pub fn new(
        coordinator: Arc<ValidationCoordinator>,
        whitelist: WhitelistStore,
        js_whitelist: JsWhitelistStore,
        replay: ReplayStore,
        key_protect: KeyProtectStore,
        logs: LogWriter,
    ) -> Self {
        Self {
            coordinator,
            whitelist,
            js_whitelist,
            replay,
            key_protect,
            logs,
        }
    }

    /// Drive the admission state machine for one request.
    pub async fn evaluate(&self, config: &GatewayConfig, ctx: RequestContext<'_>) -> Decision {
        let is_m3u8 = ctx.path.to_lowercase().ends_with(".m3u8");
        let is_enc_key = ctx.path.to_lowercase().ends_with("enc.key");
        let is_protected_key = config.is_protected_key_file(ctx.path);

        // ── Skip-all gate ──
        if config.skips_validation(ctx.path) {
            debug!(path = ctx.path, "Fully allowed extension, checks bypassed");
            return Decision::Allow(Admission {
                skip_validation: true,
                is_protected_key,
                ..Default::default()
            });
        }

        // ── Validation fan-out ──
        let outcome = self
            .coordinator
            .validate(config, ctx.client_ip, ctx.path, ctx.user_agent, ctx.uid)
            .await;
        let mut allowed = outcome.allowed;
        let mut fallback = outcome.fallback;
        let mut effective_uid: Option<String> = None;

        // ── JS-whitelist fallback ──
        if !allowed && is_static_like(config, ctx.path) && config.js_whitelist.enabled {
            match self
                .js_whitelist
                .check(ctx.path, ctx.client_ip, ctx.user_agent, ctx.uid)
                .await
            {
                Ok((true, Some(uid))) => {
                    info!(path = ctx.path, uid = %uid, ip = ctx.client_ip, "JS whitelist fallback admitted");
                    allowed = true;
                    effective_uid = Some(uid);
                }
                Ok(_) => {
                    warn!(
                        path = ctx.path,
                        ip = ctx.client_ip,
                        uid = ctx.uid.unwrap_or("unknown"),
                        "Backend validation and JS whitelist both failed"
                    );
                }
                Err(e) => {
                    // The JS fallback fails closed; backend fallback
                    // semantics already cover store degradation
                    warn!(error = %e, path = ctx.path, "JS whitelist check failed");
                }
            }
        }

        // ── Deny ──
        if !allowed {
            self.logs.log_access(
                ctx.uid.or(effective_uid.as_deref()),
                ctx.client_ip,
                ctx.user_agent,
                ctx.path,
                false,
                Some("Validation failed: backend and JS whitelist checks both failed"),
                fallback,
            );
            return Decision::Deny {
                status: 403,
                body: "Access Denied: Path not allowed".to_string(),
            };
        }

        // ── Safe-Key redirect (terminal) ──
        if is_enc_key && config.key_protect.safe_redirect_enabled {
            let location = format!("{}{}", config.key_protect.safe_redirect_base_url, ctx.path);
            info!(ip = ctx.client_ip, path = ctx.path, redirect = %location, "Safe-Key redirect");
            return Decision::Redirect { location };
        }

        // ── UID resolution: session first ──
        if outcome.session_data.is_some()
            && let Some(uid) = outcome
                .session_uid
                .clone()
                .or_else(|| outcome.session_data.as_ref().map(|d| d.uid.clone()))
        {
            effective_uid = Some(uid);
        }

        let fixed_whitelist = outcome.whitelist_uid.as_deref() == Some("fixed_whitelist");
        if fixed_whitelist {
            // Fixed-IP admissions skip the manifest/replay/key gates
            return Decision::Allow(Admission {
                effective_uid: effective_uid.or(outcome.whitelist_uid),
                session_id: outcome.session_id,
                new_session: outcome.new_session,
                is_protected_key,
                skip_validation: false,
                fallback,
            });
        }

        // ── Whitelist fallback uid + strict manifest gate ──
        //
        // The strict gate covers clients admitted by the whitelist
        // alone. Session-backed manifest requests are governed by the
        // replay counter below.
        if effective_uid.is_none()
            && let Some(resolved_uid) = outcome.whitelist_uid.clone()
        {
            effective_uid = Some(resolved_uid.clone());

            if is_m3u8 {
                let (Some(uid), Some(expires), Some(tok)) = (ctx.uid, ctx.expires, ctx.token)
                else {
                    warn!(path = ctx.path, "Manifest request missing HMAC parameters");
                    return Decision::Deny {
                        status: 400,
                        body: ".m3u8 request missing required parameters (uid, expires, token)"
                            .to_string(),
                    };
                };

                if !token::verify(uid, ctx.path, expires, tok, config.secrets.secret_key.as_bytes()) {
                    warn!(path = ctx.path, uid, "Manifest token invalid or expired");
                    return Decision::Deny {
                        status: 403,
                        body: ".m3u8 request token invalid or expired".to_string(),
                    };
                }

                match self
                    .whitelist
                    .check_m3u8_access(config, &resolved_uid, ctx.full_url, ctx.client_ip, ctx.user_agent)
                    .await
                {
                    Ok((true, info)) => {
                        debug!(uid = %resolved_uid, ?info, "Manifest access within limit");
                    }
                    Ok((false, _)) => {
                        warn!(path = ctx.path, uid = %resolved_uid, "Manifest access limit violation");
                        return Decision::Deny {
                            status: 403,
                            body: "Access Denied: Too many accesses".to_string(),
                        };
                    }
                    Err(e) => {
                        warn!(error = %e, "Manifest counter degraded open");
                        fallback = true;
                    }
                }
            }
        } else if is_m3u8 && effective_uid.is_none() {
            warn!(path = ctx.path, "Manifest request without resolved uid");
            return Decision::Deny {
                status: 403,
                body: "No valid UID for .m3u8 request".to_string(),
            };
        }

        // ── Token replay gate (key files have their own counter) ──
        if config.token_replay.enabled
            && !is_protected_key
            && let (Some(tok), Some(uid)) = (ctx.token, ctx.uid)
        {
            let (replay_allowed, info) = self
                .replay
                .check(
                    tok,
                    uid,
                    ctx.path,
                    config.token_replay.max_uses,
                    config.token_replay.ttl,
                    ctx.client_ip,
                    Some(ctx.user_agent),
                    Some(ctx.full_url),
                )
                .await;

            if info.get("fallback").and_then(|v| v.as_bool()).unwrap_or(false) {
                fallback = true;
            }

            if !replay_allowed {
                let max_uses = info.get("max_uses").and_then(|v| v.as_i64()).unwrap_or(1);
                let remaining_ttl = info
                    .get("remaining_ttl")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(config.token_replay.ttl);
                warn!(path = ctx.path, uid, ip = ctx.client_ip, "Token replay blocked");
                self.logs.log_access(
                    Some(uid),
                    ctx.client_ip,
                    ctx.user_agent,
                    ctx.path,
                    false,
                    Some("Token replay detected: max uses exceeded"),
                    fallback,
                );
                return Decision::Deny {
                    status: 403,
                    body: format!(
                        "Access Denied: Token has exceeded maximum usage limit ({} uses). Please request a new token. TTL: {}s",
                        max_uses, remaining_ttl
                    ),
                };
            }
        }

        // ── Key-file gate ──
        if is_protected_key {
            let (Some(uid), Some(tok)) = (ctx.uid, ctx.token) else {
                warn!(path = ctx.path, ip = ctx.client_ip, "Key file request missing credentials");
                self.logs.log_access(
                    Some("unknown"),
                    ctx.client_ip,
                    ctx.user_agent,
                    ctx.path,
                    false,
                    Some("Key file access denied: missing uid or token parameter"),
                    fallback,
                );
                return Decision::Deny {
                    status: 403,
                    body: "Access Denied: Missing authentication parameters for key file".to_string(),
                };
            };

            let Some(expires) = ctx.expires else {
                warn!(path = ctx.path, uid, "Key file request missing expires");
                self.logs.log_access(
                    Some(uid),
                    ctx.client_ip,
                    ctx.user_agent,
                    ctx.path,
                    false,
                    Some("Key file access denied: missing expires parameter"),
                    fallback,
                );
                return Decision::Deny {
                    status: 403,
                    body: "Access Denied: Missing expires parameter for key file".to_string(),
                };
            };

            // The token must verify against the key path itself, not
            // the manifest that referenced it
            if !token::verify(uid, ctx.path, expires, tok, config.secrets.secret_key.as_bytes()) {
                warn!(path = ctx.path, uid, ip = ctx.client_ip, "Key file token invalid");
                self.key_protect.log_event(
                    uid,
                    ctx.path,
                    ctx.client_ip,
                    true,
                    0,
                    config.key_protect.max_uses,
                    Some("hmac_invalid"),
                    Some(ctx.user_agent),
                );
                return Decision::Deny {
                    status: 403,
                    body: "Access Denied: Key file token invalid or expired".to_string(),
                };
            }

            let (key_allowed, info) = self
                .key_protect
                .check_access(
                    ctx.path,
                    uid,
                    tok,
                    ctx.client_ip,
                    config.key_protect.max_uses,
                    config.key_protect.ttl,
                    Some(ctx.user_agent),
                )
                .await;

            if info.get("fallback").and_then(|v| v.as_bool()).unwrap_or(false) {
                fallback = true;
            }

            if !key_allowed {
                let reason = info
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Key file access not allowed")
                    .to_string();
                warn!(path = ctx.path, uid, ip = ctx.client_ip, reason = %reason, "Key file replay blocked");
                self.logs.log_access(
                    Some(uid),
                    ctx.client_ip,
                    ctx.user_agent,
                    ctx.path,
                    false,
                    Some("Key file replay detected"),
                    fallback,
                );
                return Decision::Deny {
                    status: 403,
                    body: format!("Access Denied: {}", reason),
                };
            }

            info!(path = ctx.path, uid, "Key file access allowed");
        }

        Decision::Allow(Admission {
            effective_uid,
            session_id: outcome.session_id,
            new_session: outcome.new_session,
            is_protected_key,
            skip_validation: false,
            fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlsgate_core::config::GatewayConfig;

    #[test]
    fn file_type_classification() {
        assert_eq!(classify_file_type("v/index.m3u8"), FileType::M3u8);
        assert_eq!(classify_file_type("v/seg0.TS"), FileType::Ts);
        assert_eq!(classify_file_type("v/enc.key"), FileType::EncKey);
        assert_eq!(classify_file_type("s/app.js"), FileType::Static);
        assert_eq!(classify_file_type("v/movie.mp4"), FileType::Default);
    }

    #[test]
    fn file_type_labels_match_cache_policy_keys() {
        assert_eq!(FileType::M3u8.as_str(), "m3u8");
        assert_eq!(FileType::EncKey.as_str(), "enc_key");
    }

    #[test]
    fn static_like_covers_hls_and_index_files() {
        let cfg = GatewayConfig::default();
        assert!(is_static_like(&cfg, "v/2025-01-01/a/index.m3u8"));
        assert!(is_static_like(&cfg, "v/a/seg.ts"));
        assert!(is_static_like(&cfg, "v/a/enc.key"));
        assert!(is_static_like(&cfg, "v/a/playlist"));
        assert!(is_static_like(&cfg, "img/logo.png"));
        assert!(!is_static_like(&cfg, "v/a/movie.mp4"));
    }
}
