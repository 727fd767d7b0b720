use super::{authorization, json_error};
use crate::auth::validate_api_key;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};
use hlsgate_proxy::handler::extract_client_ip;
use hlsgate_proxy::AppState;
use serde::Deserialize;
use tracing::{error, warn};

#[derive(Debug, Deserialize)]
pub struct WhitelistRequest {
    pub uid: String,
    pub path: String,
    #[serde(rename = "clientIp")]
    pub client_ip: String,
    #[serde(rename = "UserAgent")]
    pub user_agent: String,
}

#[derive(Debug, Deserialize)]
pub struct StaticWhitelistRequest {
    pub uid: String,
    #[serde(rename = "clientIp")]
    pub client_ip: String,
    #[serde(rename = "UserAgent")]
    pub user_agent: String,
}

/// POST /api/whitelist — upsert a whitelist record (Bearer).
pub async fn add_whitelist(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WhitelistRequest>, JsonRejection>,
) -> Response {
    let requester = extract_client_ip(&headers, None);

    if !validate_api_key(authorization(&headers), &state.config.secrets.api_key) {
        warn!(ip = %requester, "Whitelist addition rejected: invalid API key");
        return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
    }

    let Ok(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid JSON data");
    };

    if request.uid.is_empty()
        || request.path.is_empty()
        || request.client_ip.is_empty()
        || request.user_agent.is_empty()
    {
        warn!(ip = %requester, "Whitelist addition rejected: missing fields");
        return json_error(
            StatusCode::BAD_REQUEST,
            "uid, path, clientIp, and UserAgent are required",
        );
    }

    match state
        .whitelist
        .add(&state.config, &request.uid, &request.path, &request.client_ip, &request.user_agent)
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
            error!(error = %e, "Whitelist addition failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add IP to whitelist")
        }
    }
}

/// POST /api/static-whitelist — upsert a static-file record (Bearer).
pub async fn add_static_whitelist(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<StaticWhitelistRequest>, JsonRejection>,
) -> Response {
    let requester = extract_client_ip(&headers, None);

    if !validate_api_key(authorization(&headers), &state.config.secrets.api_key) {
        warn!(ip = %requester, "Static whitelist addition rejected: invalid API key");
        return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
    }

    let Ok(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid JSON data");
    };

    if request.uid.is_empty() || request.client_ip.is_empty() || request.user_agent.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "uid, clientIp, and UserAgent are required");
    }

    match state
        .whitelist
        .add_static(&state.config, &request.uid, &request.client_ip, &request.user_agent)
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
            error!(error = %e, "Static whitelist addition failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to add to static file whitelist")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_field_names_match_the_wire() {
        let request: WhitelistRequest = serde_json::from_str(
            r#"{"uid":"315","path":"video/2025-08-30/xyz/720p/index.m3u8","clientIp":"203.0.113.9","UserAgent":"Mozilla/5.0"}"#,
        )
        .unwrap();
        assert_eq!(request.uid, "315");
        assert_eq!(request.client_ip, "203.0.113.9");
        assert_eq!(request.user_agent, "Mozilla/5.0");
    }

    #[test]
    fn static_request_has_no_path() {
        let request: StaticWhitelistRequest =
            serde_json::from_str(r#"{"uid":"7","clientIp":"10.0.0.1","UserAgent":"ua"}"#).unwrap();
        assert_eq!(request.uid, "7");
    }
}
