//! The main proxy handler: extract, admit, deliver, transform, log.

use crate::fs;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, Query, State};
use axum::response::{IntoResponse, Response};
use hlsgate_core::config::{BackendMode, SessionConfig};
use hlsgate_core::{fingerprint, playlist};
use hlsgate_gate::admission::{classify_file_type, Decision, FileType, RequestContext};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Manifests are small; anything larger than this is not rewritten.
const MAX_MANIFEST_BYTES: usize = 16 * 1024 * 1024;

/// Resolve the client IP: XFF first hop, then X-Real-IP, then the
/// peer address — always canonicalized before touching any index key.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return fingerprint::canonicalize_ip(first);
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return fingerprint::canonicalize_ip(trimmed);
        }
    }
    match peer {
        Some(addr) => fingerprint::canonicalize_ip(&addr.ip().to_string()),
        None => "unknown".to_string(),
    }
}

/// Session cookie string per the configured attributes.
pub fn build_session_cookie(config: &SessionConfig, session_id: &str) -> String {
    let mut parts = vec![
        format!("{}={}", config.cookie_name, session_id),
        "Path=/".to_string(),
        format!("Max-Age={}", config.session_ttl),
    ];
    if config.cookie_httponly {
        parts.push("HttpOnly".to_string());
    }
    if config.cookie_secure {
        parts.push("Secure".to_string());
    }
    if !config.cookie_samesite.is_empty() {
        parts.push(format!("SameSite={}", config.cookie_samesite));
    }
    parts.join("; ")
}

/// Coarse metric label for a denial body.
fn denial_label(body: &str) -> &'static str {
    if body.contains("maximum usage limit") {
        "token_replay"
    } else if body.contains("Key file") || body.contains("key file") {
        "key_file"
    } else if body.contains("Too many accesses") {
        "m3u8_limit"
    } else if body.contains("token invalid") {
        "hmac"
    } else if body.contains("missing required parameters") {
        "missing_params"
    } else {
        "not_allowed"
    }
}

/// GET|HEAD /{*path}
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    UrlPath(path): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let config = state.config.clone();

    let client_ip = extract_client_ip(&headers, Some(peer));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let full_url = uri.to_string();

    let uid = params.get("uid").map(String::as_str);
    let expires = params.get("expires").map(String::as_str);
    let token = params.get("token").map(String::as_str);

    let file_type = classify_file_type(&path);
    let is_head = method == Method::HEAD;

    let ctx = RequestContext {
        path: &path,
        full_url: &full_url,
        client_ip: &client_ip,
        user_agent: &user_agent,
        uid,
        expires,
        token,
    };

    let admission = match state.pipeline.evaluate(&config, ctx).await {
        Decision::Deny { status, body } => {
            state.metrics.record_denial(denial_label(&body));
            state.metrics.record_request(
                file_type.as_str(),
                method.as_str(),
                status,
                started.elapsed().as_secs_f64(),
            );
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
            return (status, body).into_response();
        }
        Decision::Redirect { location } => {
            state.metrics.record_request(
                file_type.as_str(),
                method.as_str(),
                302,
                started.elapsed().as_secs_f64(),
            );
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, location)
                .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        Decision::Allow(admission) => admission,
    };

    // ── Delivery dispatch ──
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let mut response = match config.backend.mode {
        BackendMode::Filesystem => {
            fs::serve(
                &config,
                &state.tracker,
                &path,
                range,
                is_head,
                admission.effective_uid.clone(),
                admission.session_id.clone(),
                file_type.as_str(),
                &client_ip,
            )
            .await
        }
        BackendMode::Http => match &state.upstream {
            Some(upstream) => {
                upstream
                    .serve(
                        &state.tracker,
                        &headers,
                        &path,
                        is_head,
                        admission.effective_uid.clone(),
                        admission.session_id.clone(),
                        file_type.as_str(),
                        &client_ip,
                        &user_agent,
                    )
                    .await
            }
            None => (StatusCode::INTERNAL_SERVER_ERROR, "Unsupported backend mode").into_response(),
        },
    };

    // ── Playlist transform ──
    if file_type == FileType::M3u8
        && config.key_protect.enabled
        && config.key_protect.dynamic_m3u8
        && response.status().is_success()
        && !is_head
        && let (Some(uid), Some(expires), Some(_token)) = (uid, expires, token)
    {
        response = transform_playlist(&state, &path, uid, expires, response).await;
    }

    // ── Key-file response hardening ──
    if admission.is_protected_key {
        let response_headers = response.headers_mut();
        response_headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        response_headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        response_headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }

    // ── Session cookie ──
    if admission.new_session
        && let Some(session_id) = &admission.session_id
        && let Ok(value) = HeaderValue::from_str(&build_session_cookie(&config.session, session_id))
    {
        info!(session_id = %session_id, ttl = config.session.session_ttl, "New session cookie set");
        response.headers_mut().insert(header::SET_COOKIE, value);
    }

    // ── Log & metrics ──
    state.logs.log_access(
        admission.effective_uid.as_deref(),
        &client_ip,
        &user_agent,
        &path,
        true,
        None,
        admission.fallback,
    );
    if let Some(bytes) = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        state.metrics.record_egress(file_type.as_str(), bytes);
    }
    state.metrics.record_request(
        file_type.as_str(),
        method.as_str(),
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    state.metrics.active_transfers.set(state.tracker.len() as i64);

    response
}

/// Rewrite a served manifest's `#EXT-X-KEY` URIs, reading the original
/// bytes through the cache. Returns the untouched response when the
/// original cannot be obtained.
async fn transform_playlist(
    state: &AppState,
    path: &str,
    uid: &str,
    expires: &str,
    response: Response,
) -> Response {
    let config = &state.config;
    let cache_ttl = config.m3u8.content_cache_ttl;
    let mut cache_hit = false;
    let mut original: Option<String> = None;

    if config.m3u8.content_cache_enabled
        && let Ok(Some(content)) = state.key_protect.cached_manifest(path).await
    {
        cache_hit = true;
        original = Some(content);
    }

    let status = response.status();
    let mut response = response;

    if original.is_none() {
        match config.backend.mode {
            BackendMode::Filesystem => {
                if let Some(full) = fs::resolve_within_root(&config.backend.filesystem_root, path)
                    && let Ok(content) = tokio::fs::read_to_string(&full).await
                {
                    if config.m3u8.content_cache_enabled
                        && let Err(e) = state.key_protect.cache_manifest(path, &content, cache_ttl).await
                    {
                        warn!(error = %e, path, "Manifest cache write failed");
                    }
                    original = Some(content);
                }
            }
            BackendMode::Http => {
                // The body was already produced; collect it
                let (parts, body) = response.into_parts();
                let bytes = match axum::body::to_bytes(body, MAX_MANIFEST_BYTES).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, path, "Manifest body collection failed");
                        return Response::from_parts(parts, Body::empty());
                    }
                };
                match String::from_utf8(bytes.to_vec()) {
                    Ok(content) => {
                        if config.m3u8.content_cache_enabled
                            && let Err(e) =
                                state.key_protect.cache_manifest(path, &content, cache_ttl).await
                        {
                            warn!(error = %e, path, "Manifest cache write failed");
                        }
                        original = Some(content);
                        response = Response::from_parts(parts, Body::from(bytes));
                    }
                    Err(_) => {
                        warn!(path, "Manifest is not valid UTF-8, served unmodified");
                        return Response::from_parts(parts, Body::from(bytes));
                    }
                }
            }
        }
    }

    let Some(content) = original else {
        warn!(path, "Original manifest unavailable, served unmodified");
        return response;
    };

    let m3u8_dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let modified = playlist::rewrite_key_uris(
        &content,
        uid,
        expires,
        config.secrets.secret_key.as_bytes(),
        m3u8_dir,
    );

    info!(
        path,
        uid,
        cache_hit,
        original_len = content.len(),
        modified_len = modified.len(),
        "Manifest key URIs rewritten"
    );

    let kept_headers: Vec<(header::HeaderName, HeaderValue)> = response
        .headers()
        .iter()
        .filter(|(name, _)| {
            **name != header::CONTENT_LENGTH
                && **name != header::TRANSFER_ENCODING
                && **name != header::CONTENT_TYPE
                && **name != header::CACHE_CONTROL
                && **name != header::PRAGMA
                && **name != header::EXPIRES
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let mut builder = Response::builder().status(status);
    for (name, value) in kept_headers {
        builder = builder.header(name, value);
    }
    builder
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CONTENT_LENGTH, modified.len())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(Body::from(modified))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response())
}
