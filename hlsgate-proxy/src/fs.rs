//! Filesystem delivery backend.
//!
//! Resolves the request path under the configured root (rejecting any
//! escape), answers Range requests per RFC 7233, and serves either a
//! whole-file fast path (small, non-Range) or an adaptive-chunked
//! accounted stream.

use crate::transfer::{TrackedStream, TransferStatus, TransferTracker};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use hlsgate_core::config::GatewayConfig;
use http::{header, StatusCode};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Adaptive chunk sizing, nginx output_buffers/sendfile_max_chunk
/// style: small files use the configured buffer, larger files step up.
pub fn adaptive_chunk_size(file_size: u64, config: &GatewayConfig) -> usize {
    const MIB: u64 = 1024 * 1024;
    if file_size < MIB {
        config.streaming.output_buffers_size
    } else if file_size < 32 * MIB {
        128 * 1024
    } else if file_size < 256 * MIB {
        512 * 1024
    } else {
        config.streaming.sendfile_max_chunk.min(2 * 1024 * 1024)
    }
}

/// MIME type by extension, with the HLS/video table taking priority.
pub fn media_type(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl".to_string(),
        "ts" => "video/mp2t".to_string(),
        "mp4" => "video/mp4".to_string(),
        "webm" => "video/webm".to_string(),
        "mkv" => "video/x-matroska".to_string(),
        "avi" => "video/x-msvideo".to_string(),
        "mov" => "video/quicktime".to_string(),
        "flv" => "video/x-flv".to_string(),
        "wmv" => "video/x-ms-wmv".to_string(),
        "key" => "application/octet-stream".to_string(),
        _ => mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string(),
    }
}

/// Cache policy by file type.
pub fn cache_headers(file_type: &str) -> Vec<(&'static str, &'static str)> {
    match file_type {
        "m3u8" => vec![
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
            ("Pragma", "no-cache"),
            ("Expires", "0"),
        ],
        "ts" => vec![("Cache-Control", "public, max-age=300")],
        "static" => vec![("Cache-Control", "public, max-age=3600")],
        _ => vec![("Cache-Control", "public, max-age=600")],
    }
}

/// Lexically resolve `req_path` under `root`, rejecting any traversal
/// above the root before the filesystem is consulted.
pub fn resolve_within_root(root: &Path, req_path: &str) -> Option<PathBuf> {
    let rel = req_path.trim_start_matches('/');
    let mut clean = PathBuf::new();
    let mut depth = 0usize;

    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                clean.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                clean.pop();
            }
            _ => return None,
        }
    }

    Some(root.join(clean))
}

fn text_response(status: StatusCode, body: &str) -> Response {
    (status, body.to_string()).into_response()
}

/// Read `[start, start + len)` of a file into memory.
async fn read_window(
    path: &Path,
    start: u64,
    len: u64,
    file_size: u64,
) -> std::io::Result<Vec<u8>> {
    if start == 0 && len == file_size {
        return tokio::fs::read(path).await;
    }
    let mut file = tokio::fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Serve a file from the filesystem backend.
#[allow(clippy::too_many_arguments)]
pub async fn serve(
    config: &GatewayConfig,
    tracker: &TransferTracker,
    req_path: &str,
    range_header: Option<&str>,
    is_head: bool,
    uid: Option<String>,
    session_id: Option<String>,
    file_type: &str,
    client_ip: &str,
) -> Response {
    let root = &config.backend.filesystem_root;

    let Some(candidate) = resolve_within_root(root, req_path) else {
        warn!(path = req_path, "Path traversal attempt");
        return text_response(StatusCode::FORBIDDEN, "Access Denied: Path traversal detected");
    };

    let full_path = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = req_path, "File not found");
            return text_response(StatusCode::NOT_FOUND, "File Not Found");
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return text_response(StatusCode::FORBIDDEN, "Access Denied: Permission denied");
        }
        Err(_) => {
            return text_response(StatusCode::BAD_REQUEST, "Bad Request: Invalid path");
        }
    };

    // Symlinks may still have led outside the root
    let canonical_root = tokio::fs::canonicalize(root).await.unwrap_or_else(|_| root.clone());
    if !full_path.starts_with(&canonical_root) {
        warn!(path = req_path, resolved = %full_path.display(), "Path traversal attempt");
        return text_response(StatusCode::FORBIDDEN, "Access Denied: Path traversal detected");
    }

    let metadata = match tokio::fs::metadata(&full_path).await {
        Ok(meta) => meta,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "File Not Found"),
    };
    if !metadata.is_file() {
        return text_response(StatusCode::FORBIDDEN, "Access Denied: Not a file");
    }

    let file_size = metadata.len();

    // Range handling
    let mut status = StatusCode::OK;
    let (start, end) = match range_header {
        Some(value) => match crate::range::parse(value, file_size) {
            Some(window) => {
                status = StatusCode::PARTIAL_CONTENT;
                window
            }
            None => {
                warn!(range = value, size = file_size, "Unsatisfiable Range");
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", file_size))
                    .body(Body::from("Range Not Satisfiable"))
                    .unwrap_or_else(|_| {
                        text_response(StatusCode::RANGE_NOT_SATISFIABLE, "Range Not Satisfiable")
                    });
            }
        },
        None => {
            if file_size == 0 {
                (0, 0)
            } else {
                (0, file_size - 1)
            }
        }
    };
    let content_length = if file_size == 0 { 0 } else { end - start + 1 };
    let is_partial = status == StatusCode::PARTIAL_CONTENT;

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::CONTENT_TYPE, media_type(req_path));
    for (name, value) in cache_headers(file_type) {
        builder = builder.header(name, value);
    }
    if is_partial {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        );
    }

    if is_head {
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"));
    }

    let path_display = full_path.to_string_lossy().to_string();

    // Buffered path: small non-Range files, and everything when
    // response streaming is switched off
    let small_whole_file =
        !is_partial && config.backend.sendfile && file_size < config.streaming.streaming_threshold;
    if small_whole_file || !config.perf.enable_response_streaming {
        let bytes = match read_window(&full_path, start, content_length, file_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, path = %path_display, "Buffered read failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };
        let transfer_id = tracker.register(
            &path_display,
            uid,
            session_id,
            client_ip,
            file_type,
            start,
            Some(end),
            Some(content_length),
        );
        tracker.record_bytes(&transfer_id, bytes.len() as u64);
        tracker.finish(&transfer_id, TransferStatus::Completed);
        debug!(path = %path_display, size = file_size, start, end, "Served via buffered path");
        return builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"));
    }

    // Streaming path with adaptive chunking and live accounting
    let mut file = match tokio::fs::File::open(&full_path).await {
        Ok(file) => file,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "File Not Found"),
    };
    if start > 0
        && let Err(e) = file.seek(SeekFrom::Start(start)).await
    {
        warn!(error = %e, path = %path_display, "Seek failed");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }

    let chunk_size = adaptive_chunk_size(file_size, config);
    let reader = ReaderStream::with_capacity(file.take(content_length), chunk_size);

    let transfer_id = tracker.register(
        &path_display,
        uid,
        session_id,
        client_ip,
        file_type,
        start,
        Some(end),
        Some(content_length),
    );
    let stream = TrackedStream::new(reader, tracker.clone(), transfer_id);

    debug!(
        path = %path_display,
        size = file_size,
        start,
        end,
        chunk = chunk_size,
        "Serving via accounted stream"
    );

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_config(root: &Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.backend.filesystem_root = root.to_path_buf();
        config
    }

    async fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("hlsgate-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        root
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    // ── Chunk policy ─────────────────────────────────────────────

    #[test]
    fn chunk_size_steps_with_file_size() {
        let config = GatewayConfig::default();
        assert_eq!(adaptive_chunk_size(512 * 1024, &config), 32 * 1024);
        assert_eq!(adaptive_chunk_size(8 * 1024 * 1024, &config), 128 * 1024);
        assert_eq!(adaptive_chunk_size(64 * 1024 * 1024, &config), 512 * 1024);
        assert_eq!(adaptive_chunk_size(512 * 1024 * 1024, &config), 2 * 1024 * 1024);
    }

    // ── MIME table ───────────────────────────────────────────────

    #[test]
    fn hls_media_types() {
        assert_eq!(media_type("a/index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(media_type("a/seg0.ts"), "video/mp2t");
        assert_eq!(media_type("a/movie.mp4"), "video/mp4");
        assert_eq!(media_type("a/enc.key"), "application/octet-stream");
        assert_eq!(media_type("a/logo.png"), "image/png");
        assert_eq!(media_type("a/unknown.zzz"), "application/octet-stream");
    }

    #[test]
    fn cache_policy_by_type() {
        assert!(cache_headers("m3u8").iter().any(|(_, v)| v.contains("no-store")));
        assert!(cache_headers("ts").iter().any(|(_, v)| v.contains("max-age=300")));
        assert!(cache_headers("static").iter().any(|(_, v)| v.contains("max-age=3600")));
        assert!(cache_headers("default").iter().any(|(_, v)| v.contains("max-age=600")));
    }

    // ── Lexical traversal guard ──────────────────────────────────

    #[test]
    fn traversal_components_are_rejected() {
        let root = Path::new("/data");
        assert!(resolve_within_root(root, "../etc/passwd").is_none());
        assert!(resolve_within_root(root, "a/../../etc/passwd").is_none());
        assert!(resolve_within_root(root, "a/b/../../../x").is_none());
    }

    #[test]
    fn normal_and_dot_components_resolve() {
        let root = Path::new("/data");
        assert_eq!(resolve_within_root(root, "a/b/c.ts").unwrap(), Path::new("/data/a/b/c.ts"));
        assert_eq!(resolve_within_root(root, "./a/./b").unwrap(), Path::new("/data/a/b"));
        // Dotdot that stays inside the root is fine
        assert_eq!(resolve_within_root(root, "a/../b.ts").unwrap(), Path::new("/data/b.ts"));
    }

    // ── End-to-end serves ────────────────────────────────────────

    #[tokio::test]
    async fn serves_whole_file_with_content_length() {
        let root = temp_root().await;
        tokio::fs::write(root.join("seg0.ts"), b"0123456789").await.unwrap();
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response =
            serve(&config, &tracker, "seg0.ts", None, false, None, None, "ts", "1.2.3.4").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn range_request_returns_exact_window() {
        // Body must be exactly bytes [a, b], headers must match
        let root = temp_root().await;
        tokio::fs::write(root.join("seg0.ts"), b"0123456789").await.unwrap();
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response = serve(
            &config, &tracker, "seg0.ts", Some("bytes=2-5"), false, None, None, "ts", "1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(body_bytes(response).await, b"2345");
    }

    #[tokio::test]
    async fn invalid_range_is_416_with_star_range() {
        let root = temp_root().await;
        tokio::fs::write(root.join("seg0.ts"), b"0123456789").await.unwrap();
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response = serve(
            &config, &tracker, "seg0.ts", Some("bytes=50-60"), false, None, None, "ts", "1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let root = temp_root().await;
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response =
            serve(&config, &tracker, "nope.ts", None, false, None, None, "ts", "1.2.3.4").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_is_403() {
        let root = temp_root().await;
        tokio::fs::create_dir(root.join("dir")).await.unwrap();
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response =
            serve(&config, &tracker, "dir", None, false, None, None, "default", "1.2.3.4").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn traversal_is_403() {
        let root = temp_root().await;
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response = serve(
            &config, &tracker, "../../etc/passwd", None, false, None, None, "default", "1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_bytes(response).await, b"Access Denied: Path traversal detected");
    }

    #[tokio::test]
    async fn head_request_has_headers_but_no_body() {
        let root = temp_root().await;
        tokio::fs::write(root.join("index.m3u8"), b"#EXTM3U\n").await.unwrap();
        let config = test_config(&root);
        let tracker = TransferTracker::new();

        let response = serve(
            &config, &tracker, "index.m3u8", None, true, None, None, "m3u8", "1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "8");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.apple.mpegurl"
        );
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn buffered_range_when_streaming_disabled() {
        let root = temp_root().await;
        tokio::fs::write(root.join("seg0.ts"), b"0123456789").await.unwrap();
        let mut config = test_config(&root);
        config.perf.enable_response_streaming = false;
        let tracker = TransferTracker::new();

        let response = serve(
            &config, &tracker, "seg0.ts", Some("bytes=1-3"), false, None, None, "ts", "1.2.3.4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"123");
    }

    #[tokio::test]
    async fn streamed_range_on_large_threshold() {
        // Force the streaming path by lowering the threshold
        let root = temp_root().await;
        tokio::fs::write(root.join("big.ts"), vec![7u8; 4096]).await.unwrap();
        let mut config = test_config(&root);
        config.streaming.streaming_threshold = 1024;
        let tracker = TransferTracker::new();

        let response =
            serve(&config, &tracker, "big.ts", None, false, None, None, "ts", "1.2.3.4").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert_eq!(body.len(), 4096);
        assert!(body.iter().all(|&b| b == 7));
    }
}
