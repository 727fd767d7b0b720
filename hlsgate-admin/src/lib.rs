//! Admin/API surface: whitelist management, JS-whitelist endpoints,
//! file existence probes, monitoring, and debug endpoints.

pub mod auth;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use hlsgate_proxy::AppState;

/// All admin/monitoring routes, merged into the main app router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Whitelist management
        .route("/api/whitelist", post(handlers::whitelist::add_whitelist))
        .route("/api/static-whitelist", post(handlers::whitelist::add_static_whitelist))
        // JS whitelist
        .route(
            "/api/js-whitelist",
            post(handlers::js_whitelist::add_entry).get(handlers::js_whitelist::add_entry),
        )
        .route("/api/js-whitelist/check", get(handlers::js_whitelist::check_entry))
        .route("/api/js-whitelist/stats", get(handlers::js_whitelist::entry_stats))
        // File existence probes
        .route("/api/file/check", post(handlers::file_check::check_file))
        .route("/api/file/check/batch", post(handlers::file_check::check_files_batch))
        // Monitoring
        .route("/health", get(handlers::monitoring::health))
        .route("/stats", get(handlers::monitoring::stats))
        .route("/traffic", get(handlers::monitoring::traffic))
        .route("/active-transfers", get(handlers::monitoring::active_transfers))
        .route("/whitelist-info", get(handlers::monitoring::whitelist_info))
        .route("/probe/backend", get(handlers::monitoring::probe_backend))
        .route("/metrics", get(handlers::monitoring::metrics))
        // Log rings
        .route("/api/access-logs/denied", get(handlers::monitoring::denied_logs))
        .route("/api/access-logs/recent", get(handlers::monitoring::recent_logs))
        .route("/api/access-logs/summary", get(handlers::monitoring::access_log_summary))
        .route("/api/replay-logs", get(handlers::monitoring::replay_logs))
        .route("/api/replay-logs/summary", get(handlers::monitoring::replay_log_summary))
        .route("/api/key-access-logs", get(handlers::monitoring::key_access_logs))
        .route("/api/key-access-logs/summary", get(handlers::monitoring::key_access_log_summary))
        .route("/api/m3u8-cache-stats", get(handlers::monitoring::m3u8_cache_stats))
        // Debug
        .route("/debug/browser", get(handlers::debug::browser))
        .route("/debug/cidr", get(handlers::debug::cidr))
        .route("/debug/ip-whitelist", get(handlers::debug::ip_whitelist))
        .route("/debug/session", get(handlers::debug::session))
}
