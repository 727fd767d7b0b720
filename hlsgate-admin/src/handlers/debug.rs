use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hlsgate_core::{browser, cidr, fingerprint};
use hlsgate_proxy::handler::extract_client_ip;
use hlsgate_proxy::AppState;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct BrowserQuery {
    pub user_agent: Option<String>,
}

/// GET /debug/browser — classify a UA (query param or request header).
pub async fn browser(Query(query): Query<BrowserQuery>, headers: HeaderMap) -> Response {
    let user_agent = query.user_agent.unwrap_or_else(|| {
        headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    });

    let (kind, name, suggested) = browser::detect(&user_agent);
    let body = json!({
        "user_agent": user_agent,
        "browser_type": kind.as_str(),
        "browser_name": name,
        "suggested_max_count": suggested,
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CidrQuery {
    pub ip: String,
    pub pattern: Option<String>,
}

/// GET /debug/cidr — normalization and matching for one IP/pattern.
pub async fn cidr(Query(query): Query<CidrQuery>) -> Response {
    let normalized = cidr::normalize(&query.ip);
    let mut body = json!({
        "ip": query.ip,
        "is_ip": cidr::is_ip(&query.ip),
        "is_cidr": cidr::is_cidr(&query.ip),
        "normalized": normalized,
        "examples": cidr::examples(&normalized, 3),
    });

    if let Some(pattern) = &query.pattern {
        let (matched, matched_pattern) =
            cidr::match_patterns(&query.ip, std::slice::from_ref(pattern));
        body["pattern"] = json!(pattern);
        body["matches"] = json!(matched);
        body["matched_pattern"] = json!(matched_pattern);
    }

    (StatusCode::OK, Json(body)).into_response()
}

/// GET /debug/ip-whitelist — what the gateway sees for this requester.
pub async fn ip_whitelist(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let client_ip = extract_client_ip(&headers, None);
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let (fixed, fixed_pattern) =
        cidr::match_patterns(&client_ip, &state.config.whitelist.fixed_ip_whitelist);
    let (static_allowed, static_uid) = state
        .whitelist
        .check_static_access(&client_ip, user_agent)
        .await
        .unwrap_or((false, None));

    let body = json!({
        "client_ip": client_ip,
        "ua_hash": fingerprint::ua_hash(user_agent),
        "ip_hash": fingerprint::ip_hash(&client_ip),
        "fixed_whitelist_match": fixed,
        "fixed_whitelist_pattern": fixed_pattern,
        "static_whitelist_match": static_allowed,
        "static_whitelist_uid": static_uid,
    });
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// GET /debug/session — validate a session against this requester.
pub async fn session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let client_ip = extract_client_ip(&headers, None);
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let record = state
        .sessions
        .validate(&query.session_id, &client_ip, user_agent)
        .await
        .unwrap_or(None);

    let body = match record {
        Some(record) => json!({
            "valid": true,
            "session_id": query.session_id,
            "uid": record.uid,
            "key_path": record.key_path,
            "created_at": record.created_at,
            "last_activity": record.last_activity,
            "access_count": record.access_count,
        }),
        None => json!({
            "valid": false,
            "session_id": query.session_id,
        }),
    };
    (StatusCode::OK, Json(body)).into_response()
}
