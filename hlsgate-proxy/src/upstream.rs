//! Upstream-HTTP delivery backend.
//!
//! Streams bodies from a pooled client, forwarding the conditional
//! and Range headers, stripping hop-by-hop and CORS-echo headers from
//! the upstream response, and overlaying the gateway's cache policy.

use crate::fs::cache_headers;
use crate::transfer::{TrackedStream, TransferTracker};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use hlsgate_core::config::BackendConfig;
use http::{header, HeaderMap, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Upstream response headers that never pass through: hop-by-hop,
/// body-coding, CORS echoes, and the cache fields we overlay.
const STRIPPED_HEADERS: &[&str] = &[
    "transfer-encoding",
    "content-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-allow-credentials",
    "access-control-max-age",
    "access-control-expose-headers",
    "cache-control",
    "pragma",
    "expires",
];

fn should_forward_response_header(name: &str) -> bool {
    !STRIPPED_HEADERS.contains(&name.to_lowercase().as_str())
}

/// Request headers forwarded verbatim to the upstream.
const FORWARDED_REQUEST_HEADERS: &[header::HeaderName] = &[
    header::RANGE,
    header::IF_RANGE,
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
];

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    host_header: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()?;

        let scheme = if config.use_https { "https" } else { "http" };
        Ok(Self {
            client,
            base_url: format!("{}://{}:{}", scheme, config.host, config.port),
            host_header: config.proxy_host_header.clone(),
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Proxy a request upstream and stream the body back.
    #[allow(clippy::too_many_arguments)]
    pub async fn serve(
        &self,
        tracker: &TransferTracker,
        incoming: &HeaderMap,
        path: &str,
        is_head: bool,
        uid: Option<String>,
        session_id: Option<String>,
        file_type: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Response {
        let url = self.url_for(path);

        let mut request = self
            .client
            .get(&url)
            .header(header::USER_AGENT, user_agent)
            .header("X-Forwarded-For", client_ip);
        if let Some(host) = &self.host_header {
            request = request.header(header::HOST, host.as_str());
        }
        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = incoming.get(name) {
                request = request.header(name, value);
            }
        }

        let upstream = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(url = %url, "Upstream timeout");
                return (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response();
            }
            Err(e) if e.is_connect() => {
                warn!(url = %url, error = %e, "Upstream connect error");
                return (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}", e)).into_response();
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Upstream request failed");
                return (StatusCode::BAD_GATEWAY, format!("Proxy Failed: {}", e)).into_response();
            }
        };

        let status = upstream.status();
        if status.as_u16() >= 400 {
            warn!(url = %url, status = status.as_u16(), "Upstream error status");
            return Response::builder()
                .status(status.as_u16())
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        }

        let total_size = upstream.content_length();

        let mut builder = Response::builder().status(status.as_u16());
        let mut saw_accept_ranges = false;
        for (name, value) in upstream.headers() {
            if !should_forward_response_header(name.as_str()) {
                continue;
            }
            if *name == header::ACCEPT_RANGES {
                saw_accept_ranges = true;
            }
            builder = builder.header(name.clone(), value.clone());
        }
        if !saw_accept_ranges {
            builder = builder.header(header::ACCEPT_RANGES, "bytes");
        }
        for (name, value) in cache_headers(file_type) {
            builder = builder.header(name, value);
        }

        if is_head {
            return builder
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        }

        let transfer_id = tracker.register(
            path,
            uid,
            session_id,
            client_ip,
            file_type,
            0,
            total_size.and_then(|t| t.checked_sub(1)),
            total_size,
        );
        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let tracked = TrackedStream::new(Box::pin(stream), tracker.clone(), transfer_id);

        debug!(url = %url, status = status.as_u16(), "Streaming upstream body");

        builder
            .body(Body::from_stream(tracked))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }

    /// Existence probe via HEAD, for the file-check endpoints.
    pub async fn probe(&self, path: &str) -> serde_json::Value {
        let url = self.url_for(path);
        match self.client.head(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                serde_json::json!({
                    "path": path,
                    "exists": response.status().is_success(),
                    "status": status,
                    "size": response.content_length(),
                })
            }
            Err(e) => serde_json::json!({
                "path": path,
                "exists": false,
                "error": e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlsgate_core::config::BackendConfig;

    fn client() -> UpstreamClient {
        let mut config = BackendConfig::default();
        config.host = "origin.example.com".into();
        config.port = 8443;
        config.use_https = true;
        UpstreamClient::new(&config).unwrap()
    }

    #[test]
    fn url_composition() {
        let upstream = client();
        assert_eq!(
            upstream.url_for("video/a/index.m3u8"),
            "https://origin.example.com:8443/video/a/index.m3u8"
        );
        assert_eq!(
            upstream.url_for("/video/a/seg.ts"),
            "https://origin.example.com:8443/video/a/seg.ts"
        );
    }

    #[test]
    fn hop_by_hop_and_cors_echo_headers_are_stripped() {
        assert!(!should_forward_response_header("Transfer-Encoding"));
        assert!(!should_forward_response_header("connection"));
        assert!(!should_forward_response_header("Access-Control-Allow-Origin"));
        assert!(!should_forward_response_header("cache-control"));
        assert!(should_forward_response_header("content-length"));
        assert!(should_forward_response_header("content-type"));
        assert!(should_forward_response_header("etag"));
        assert!(should_forward_response_header("last-modified"));
    }
}
