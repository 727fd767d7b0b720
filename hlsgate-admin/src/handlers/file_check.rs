use super::{authorization, json_error};
use crate::auth::validate_api_key;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};
use hlsgate_core::config::BackendMode;
use hlsgate_proxy::fs::resolve_within_root;
use hlsgate_proxy::AppState;
use serde::Deserialize;
use serde_json::json;

/// Batch probes are capped to keep one request from fanning out
/// unbounded backend I/O.
const MAX_BATCH_PATHS: usize = 50;

#[derive(Debug, Deserialize)]
pub struct FileCheckRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FileCheckBatchRequest {
    pub paths: Vec<String>,
}

async fn probe_path(state: &AppState, path: &str) -> serde_json::Value {
    match state.config.backend.mode {
        BackendMode::Filesystem => {
            let Some(full) = resolve_within_root(&state.config.backend.filesystem_root, path) else {
                return json!({ "path": path, "exists": false, "error": "Invalid path" });
            };
            match tokio::fs::metadata(&full).await {
                Ok(meta) if meta.is_file() => json!({
                    "path": path,
                    "exists": true,
                    "size": meta.len(),
                }),
                Ok(_) => json!({ "path": path, "exists": false, "error": "Not a file" }),
                Err(_) => json!({ "path": path, "exists": false }),
            }
        }
        BackendMode::Http => match &state.upstream {
            Some(upstream) => upstream.probe(path).await,
            None => json!({ "path": path, "exists": false, "error": "Backend unavailable" }),
        },
    }
}

/// POST /api/file/check — single existence probe (Bearer).
pub async fn check_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<FileCheckRequest>, JsonRejection>,
) -> Response {
    if !validate_api_key(authorization(&headers), &state.config.secrets.api_key) {
        return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
    }
    let Ok(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid JSON data");
    };
    if request.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }

    let result = probe_path(&state, &request.path).await;
    (StatusCode::OK, Json(result)).into_response()
}

/// POST /api/file/check/batch — bounded multi-path probe (Bearer).
pub async fn check_files_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<FileCheckBatchRequest>, JsonRejection>,
) -> Response {
    if !validate_api_key(authorization(&headers), &state.config.secrets.api_key) {
        return json_error(StatusCode::FORBIDDEN, "Invalid or missing API key");
    }
    let Ok(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid JSON data");
    };
    if request.paths.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "paths is required");
    }
    if request.paths.len() > MAX_BATCH_PATHS {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Too many paths in one batch (max 50)",
        );
    }

    let mut results = Vec::with_capacity(request.paths.len());
    for path in &request.paths {
        results.push(probe_path(&state, path).await);
    }

    (
        StatusCode::OK,
        Json(json!({ "count": results.len(), "results": results })),
    )
        .into_response()
}
