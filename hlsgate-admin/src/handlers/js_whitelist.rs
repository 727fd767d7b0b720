use super::{authorization, json_error};
use crate::auth::validate_api_key;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hlsgate_core::token;
use hlsgate_proxy::handler::extract_client_ip;
use hlsgate_proxy::AppState;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct JsWhitelistQuery {
    pub uid: Option<String>,
    pub js_path: Option<String>,
    pub expires: Option<String>,
    pub sign: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsWhitelistBody {
    pub uid: Option<String>,
    #[serde(rename = "jsPath", default)]
    pub js_path: Option<String>,
}

/// POST|GET /api/js-whitelist — two auth modes: Bearer API key with a
/// JSON body (POST), or a front-end HMAC signature in the query
/// (GET or POST). An empty js_path is the wildcard mode.
pub async fn add_entry(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<JsWhitelistQuery>,
    headers: HeaderMap,
    body: Option<Json<JsWhitelistBody>>,
) -> Response {
    if !state.config.js_whitelist.enabled {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "JS whitelist tracker is disabled", "enabled": false })),
        )
            .into_response();
    }

    let client_ip = extract_client_ip(&headers, None);
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let auth = authorization(&headers);
    let use_api_key = auth.is_some();
    let use_hmac = query.sign.is_some() && query.expires.is_some();

    let (uid, js_path) = if use_api_key {
        if !validate_api_key(auth, &state.config.secrets.api_key) {
            warn!(ip = %client_ip, "JS whitelist addition rejected: invalid API key");
            return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
        }
        if method != Method::POST {
            return json_error(StatusCode::BAD_REQUEST, "API Key authentication requires POST method");
        }
        let Some(Json(body)) = body else {
            return json_error(StatusCode::BAD_REQUEST, "Invalid JSON data");
        };
        (body.uid, body.js_path.or(Some(String::new())))
    } else if use_hmac {
        let Some(uid) = query.uid.clone() else {
            return json_error(StatusCode::BAD_REQUEST, "uid is required for HMAC auth");
        };
        let js_path = query.js_path.clone().unwrap_or_default();
        let expires = query.expires.as_deref().unwrap_or_default();
        let sign = query.sign.as_deref().unwrap_or_default();

        if !token::verify(
            &uid,
            &js_path,
            expires,
            sign,
            state.config.secrets.js_whitelist_secret_key.as_bytes(),
        ) {
            warn!(ip = %client_ip, "JS whitelist addition rejected: invalid HMAC signature");
            return json_error(StatusCode::FORBIDDEN, "Invalid or expired signature");
        }
        info!(uid = %uid, wildcard = js_path.is_empty(), "JS whitelist signature verified");
        (Some(uid), Some(js_path))
    } else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "Authentication required: use either API Key or HMAC signature",
        );
    };

    let Some(uid) = uid.filter(|u| !u.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "uid is required");
    };
    let js_path = js_path.unwrap_or_default();

    match state
        .js_whitelist
        .add(&state.config, &uid, &js_path, &client_ip, &user_agent)
        .await
    {
        Ok(result) => {
            let status = if result.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            (status, Json(result)).into_response()
        }
        Err(e) => {
            error!(error = %e, "JS whitelist addition failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add to JS whitelist")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub js_path: String,
    pub uid: Option<String>,
}

/// GET /api/js-whitelist/check — validate the requester's IP+UA
/// against the whitelist. No API key required.
pub async fn check_entry(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.config.js_whitelist.enabled {
        return (
            StatusCode::OK,
            Json(json!({
                "is_allowed": true,
                "enabled": false,
                "message": "JS whitelist tracker is disabled, access allowed by default",
            })),
        )
            .into_response();
    }

    let client_ip = extract_client_ip(&headers, None);
    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    match state
        .js_whitelist
        .check(&query.js_path, &client_ip, user_agent, query.uid.as_deref())
        .await
    {
        Ok((allowed, uid)) => {
            let status = if allowed { StatusCode::OK } else { StatusCode::FORBIDDEN };
            (
                status,
                Json(json!({
                    "is_allowed": allowed,
                    "js_path": query.js_path,
                    "uid": uid.or(query.uid),
                    "client_ip": client_ip,
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "JS whitelist check failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to check JS whitelist")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub uid: String,
}

/// GET /api/js-whitelist/stats — per-uid entries (Bearer).
pub async fn entry_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.config.js_whitelist.enabled {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "JS whitelist tracker is disabled", "enabled": false })),
        )
            .into_response();
    }

    if !validate_api_key(authorization(&headers), &state.config.secrets.api_key) {
        return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
    }

    match state.js_whitelist.stats(&query.uid).await {
        Ok(mut stats) => {
            stats["ttl_config"] = json!(state.config.js_whitelist.tracker_ttl);
            (StatusCode::OK, Json(stats)).into_response()
        }
        Err(e) => {
            error!(error = %e, "JS whitelist stats failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get JS whitelist stats")
        }
    }
}
