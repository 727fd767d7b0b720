use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hlsgate_core::config::BackendMode;
use hlsgate_proxy::fs::resolve_within_root;
use hlsgate_proxy::AppState;
use hlsgate_store::{access_log, key_protect, replay};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let redis_ok = state.store.ping().await.is_ok();
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    let body = json!({
        "status": if redis_ok { "ok" } else { "degraded" },
        "redis": redis_ok,
        "backend_mode": match state.config.backend.mode {
            BackendMode::Filesystem => "filesystem",
            BackendMode::Http => "http",
        },
        "uptime_seconds": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /stats — effective performance configuration.
pub async fn stats(State(state): State<AppState>) -> Response {
    let config = &state.config;
    let body = json!({
        "perf": {
            "parallel_validation": config.perf.enable_parallel_validation,
            "request_deduplication": config.perf.enable_request_deduplication,
            "response_streaming": config.perf.enable_response_streaming,
            "redis_pipeline": config.redis.enable_pipeline,
        },
        "streaming": {
            "streaming_threshold": config.streaming.streaming_threshold,
            "sendfile_max_chunk": config.streaming.sendfile_max_chunk,
            "output_buffers_size": config.streaming.output_buffers_size,
            "chunk_size": config.streaming.chunk_size,
        },
        "redis_pool_size": config.redis.pool_size,
        "workers": config.effective_workers(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /traffic — aggregate live bandwidth.
pub async fn traffic(State(state): State<AppState>) -> Response {
    let stats = state.tracker.stats();
    let body = json!({
        "active_transfers": stats["active_transfers"],
        "completed_transfers": stats["completed_transfers"],
        "total_speed_bps": stats["total_speed_bps"],
        "total_speed_mbps": stats["total_speed_mbps"],
        "timestamp": stats["timestamp"],
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /active-transfers — full transfer detail.
pub async fn active_transfers(State(state): State<AppState>) -> Response {
    let stats = state.tracker.stats();
    state.metrics.active_transfers.set(state.tracker.len() as i64);
    (StatusCode::OK, Json(stats)).into_response()
}

/// GET /whitelist-info
pub async fn whitelist_info(State(state): State<AppState>) -> Response {
    let mut info = state.whitelist.info().await.unwrap_or_else(|e| json!({ "error": e.to_string() }));
    info["fixed_ip_whitelist_count"] = json!(state.config.whitelist.fixed_ip_whitelist.len());
    info["max_paths_per_cidr"] = json!(state.config.whitelist.max_paths_per_cidr);
    info["max_ua_ip_pairs_per_uid"] = json!(state.config.whitelist.max_ua_ip_pairs_per_uid);
    info["ip_access_ttl"] = json!(state.config.whitelist.ip_access_ttl);
    (StatusCode::OK, Json(info)).into_response()
}

/// GET /probe/backend?path=… — does the backend hold this file?
pub async fn probe_backend(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Response {
    let result = match state.config.backend.mode {
        BackendMode::Filesystem => {
            match resolve_within_root(&state.config.backend.filesystem_root, &query.path) {
                Some(full) => match tokio::fs::metadata(&full).await {
                    Ok(meta) => json!({
                        "path": query.path,
                        "exists": meta.is_file(),
                        "size": meta.len(),
                        "is_file": meta.is_file(),
                    }),
                    Err(_) => json!({ "path": query.path, "exists": false }),
                },
                None => json!({ "path": query.path, "exists": false, "error": "Invalid path" }),
            }
        }
        BackendMode::Http => match &state.upstream {
            Some(upstream) => upstream.probe(&query.path).await,
            None => json!({ "path": query.path, "exists": false, "error": "Backend unavailable" }),
        },
    };
    (StatusCode::OK, Json(result)).into_response()
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.active_transfers.set(state.tracker.len() as i64);
    state.metrics.gather_text().into_response()
}

// ── Log rings ─────────────────────────────────────────────────────

/// GET /api/access-logs/denied
pub async fn denied_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 100);
    let records = access_log::denied_logs(&state.store, limit).await;
    (StatusCode::OK, Json(json!({ "count": records.len(), "records": records }))).into_response()
}

/// GET /api/access-logs/recent
pub async fn recent_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(100).clamp(1, 100);
    let records = access_log::recent_logs(&state.store, limit).await;
    (StatusCode::OK, Json(json!({ "count": records.len(), "records": records }))).into_response()
}

/// GET /api/access-logs/summary
pub async fn access_log_summary(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(access_log::summary(&state.store).await)).into_response()
}

/// GET /api/replay-logs
pub async fn replay_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(300).clamp(1, 300);
    let records = replay::logs(&state.store, limit).await;
    (StatusCode::OK, Json(json!({ "count": records.len(), "records": records }))).into_response()
}

/// GET /api/replay-logs/summary
pub async fn replay_log_summary(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(replay::summary(&state.store).await)).into_response()
}

/// GET /api/key-access-logs
pub async fn key_access_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(300).clamp(1, 300);
    let records = key_protect::logs(&state.store, limit).await;
    (StatusCode::OK, Json(json!({ "count": records.len(), "records": records }))).into_response()
}

/// GET /api/key-access-logs/summary
pub async fn key_access_log_summary(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(key_protect::summary(&state.store).await)).into_response()
}

/// GET /api/m3u8-cache-stats
pub async fn m3u8_cache_stats(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.key_protect.cache_stats().await)).into_response()
}
