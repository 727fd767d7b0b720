use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration for the hlsgate gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Cryptographic material
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Backend (filesystem or upstream HTTP) configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Streaming delivery tuning
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Session store & cookie configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// IP/CIDR whitelist policy
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Token anti-replay policy
    #[serde(default)]
    pub token_replay: TokenReplayConfig,

    /// Key-file dynamic protection policy
    #[serde(default)]
    pub key_protect: KeyProtectConfig,

    /// Manifest cache & per-browser-class access limits
    #[serde(default)]
    pub m3u8: M3u8Config,

    /// JS-whitelist (front-end submitted) policy
    #[serde(default)]
    pub js_whitelist: JsWhitelistConfig,

    /// Validation coordinator switches
    #[serde(default)]
    pub perf: PerfConfig,

    /// Test-mode bypass switches (production: all false)
    #[serde(default)]
    pub testing: TestingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. redis://:pass@host:6379/6
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size hint
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Batch multi-key operations through a pipeline
    #[serde(default = "default_true")]
    pub enable_pipeline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// HMAC secret for playback tokens (uid/path/expires)
    #[serde(default)]
    pub secret_key: String,

    /// HMAC secret for JS-whitelist front-end signatures
    #[serde(default)]
    pub js_whitelist_secret_key: String,

    /// API key for the admin endpoints
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Serve from the local filesystem
    Filesystem,
    /// Proxy to an upstream HTTP origin
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend mode: "filesystem" or "http"
    #[serde(default = "default_backend_mode")]
    pub mode: BackendMode,

    /// Root directory for filesystem mode (path-traversal anchor)
    #[serde(default = "default_filesystem_root")]
    pub filesystem_root: PathBuf,

    /// Use the zero-copy fast path for small non-Range responses
    #[serde(default = "default_true")]
    pub sendfile: bool,

    /// Upstream host (http mode)
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Upstream port (http mode)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Use HTTPS towards the upstream
    #[serde(default)]
    pub use_https: bool,

    /// Verify the upstream TLS certificate
    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// Host header to present to the upstream
    #[serde(default)]
    pub proxy_host_header: Option<String>,

    /// Upstream connect timeout (milliseconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upstream pool: max idle connections per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Size at or above which responses stream instead of the
    /// zero-copy whole-file path
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold: u64,

    /// Ceiling for the adaptive chunk size
    #[serde(default = "default_sendfile_max_chunk")]
    pub sendfile_max_chunk: usize,

    /// Default output buffer size (smallest chunk class)
    #[serde(default = "default_output_buffers_size")]
    pub output_buffers_size: usize,

    /// Output buffer count
    #[serde(default = "default_output_buffers_count")]
    pub output_buffers_count: usize,

    /// Chunk size for upstream-HTTP streaming
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session record TTL (seconds), sliding
    #[serde(default = "default_session_ttl")]
    pub session_ttl: i64,

    /// User-active lookup key TTL (seconds)
    #[serde(default = "default_user_session_ttl")]
    pub user_session_ttl: i64,

    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Cookie HttpOnly attribute
    #[serde(default = "default_true")]
    pub cookie_httponly: bool,

    /// Cookie Secure attribute
    #[serde(default)]
    pub cookie_secure: bool,

    /// Cookie SameSite attribute (empty = omit)
    #[serde(default = "default_samesite")]
    pub cookie_samesite: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Whitelist record TTL (seconds), sliding via rewrite
    #[serde(default = "default_ip_access_ttl")]
    pub ip_access_ttl: i64,

    /// FIFO cap on key paths per (pattern, UA) record
    #[serde(default = "default_max_paths_per_cidr")]
    pub max_paths_per_cidr: usize,

    /// FIFO cap on (pattern, UA) pairs per uid
    #[serde(default = "default_max_ua_ip_pairs")]
    pub max_ua_ip_pairs_per_uid: usize,

    /// IPs/CIDRs that bypass all admission checks
    #[serde(default)]
    pub fixed_ip_whitelist: Vec<String>,

    /// Static files validate IP+UA only (skip the path check)
    #[serde(default = "default_true")]
    pub enable_static_file_ip_only_check: bool,

    /// Extensions classified as static files
    #[serde(default = "default_static_file_extensions")]
    pub static_file_extensions: Vec<String>,

    /// Extensions that bypass all checks entirely
    #[serde(default = "default_fully_allowed_extensions")]
    pub fully_allowed_extensions: Vec<String>,

    /// Skip-validation set used when the IP-only static check is off
    #[serde(default = "default_legacy_skip_extensions")]
    pub legacy_skip_validation_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReplayConfig {
    /// Enable the token anti-replay counter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum uses per (token, uid, path)
    #[serde(default = "default_one")]
    pub max_uses: i64,

    /// Counter TTL (seconds)
    #[serde(default = "default_replay_ttl")]
    pub ttl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyProtectConfig {
    /// Enable key-file dynamic protection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rewrite #EXT-X-KEY URIs in served manifests
    #[serde(default = "default_true")]
    pub dynamic_m3u8: bool,

    /// Maximum accesses per (token, uid, key path)
    #[serde(default = "default_one")]
    pub max_uses: i64,

    /// Counter TTL (seconds)
    #[serde(default = "default_replay_ttl")]
    pub ttl: i64,

    /// Protected key-file suffixes
    #[serde(default = "default_key_extensions")]
    pub extensions: Vec<String>,

    /// Redirect authorized enc.key requests to an external origin
    #[serde(default)]
    pub safe_redirect_enabled: bool,

    /// Base URL for the Safe-Key redirect
    #[serde(default)]
    pub safe_redirect_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct M3u8Config {
    /// Read-through cache of original manifest bytes
    #[serde(default = "default_true")]
    pub content_cache_enabled: bool,

    /// Manifest cache TTL (seconds)
    #[serde(default = "default_m3u8_cache_ttl")]
    pub content_cache_ttl: i64,

    /// Fallback window when adaptive access is disabled (seconds)
    #[serde(default = "default_m3u8_single_use_ttl")]
    pub single_use_ttl: i64,

    /// Fallback access count when adaptive access is disabled
    #[serde(default = "default_one_u32")]
    pub default_max_access_count: u32,

    /// Pick per-browser-class limits from `access_limits`
    #[serde(default = "default_true")]
    pub enable_browser_adaptive_access: bool,

    /// class -> browser name (or "default") -> allowed accesses
    #[serde(default = "default_m3u8_access_limits")]
    pub access_limits: HashMap<String, HashMap<String, u32>>,

    /// class -> counting window (seconds)
    #[serde(default = "default_m3u8_access_window_ttl")]
    pub access_window_ttl: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsWhitelistConfig {
    /// Enable the JS-whitelist fallback path
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JS-whitelist record TTL (seconds)
    #[serde(default = "default_js_ttl")]
    pub tracker_ttl: i64,

    /// Front-end signature validity window (seconds)
    #[serde(default = "default_js_ttl")]
    pub signature_ttl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    /// Run whitelist and session checks concurrently
    #[serde(default = "default_true")]
    pub enable_parallel_validation: bool,

    /// Coalesce identical in-flight validations
    #[serde(default = "default_true")]
    pub enable_request_deduplication: bool,

    /// Stream response bodies (vs. buffering)
    #[serde(default = "default_true")]
    pub enable_response_streaming: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestingConfig {
    /// Skip the IP whitelist check
    #[serde(default)]
    pub disable_ip_whitelist: bool,

    /// Skip the path-protection check
    #[serde(default)]
    pub disable_path_protection: bool,

    /// Skip session validation
    #[serde(default)]
    pub disable_session_validation: bool,
}

impl GatewayConfig {
    /// Load configuration from a YAML file + environment variables.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["hlsgate.yaml", "/etc/hlsgate/hlsgate.yaml", "config/hlsgate.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // Environment overrides: HLSGATE_BACKEND__FILESYSTEM_ROOT, etc.
        figment = figment.merge(Env::prefixed("HLSGATE_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Worker count with the 0 = auto rule applied.
    pub fn effective_workers(&self) -> usize {
        if self.server.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.server.workers
        }
    }

    /// True when the path ends with one of the protected key suffixes.
    pub fn is_protected_key_file(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        self.key_protect.enabled
            && self.key_protect.extensions.iter().any(|ext| lower.ends_with(&ext.to_lowercase()))
    }

    /// True when the path carries a static-file extension.
    pub fn is_static_file(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        self.whitelist.static_file_extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }

    /// Skip-all classification: fully-allowed extensions when the
    /// static IP-only check is on, the legacy set otherwise.
    pub fn skips_validation(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        let set = if self.whitelist.enable_static_file_ip_only_check {
            &self.whitelist.fully_allowed_extensions
        } else {
            &self.whitelist.legacy_skip_validation_extensions
        };
        set.iter().any(|ext| lower.ends_with(ext.as_str()))
    }
}

// Default implementations

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            secrets: SecretsConfig::default(),
            backend: BackendConfig::default(),
            streaming: StreamingConfig::default(),
            session: SessionConfig::default(),
            whitelist: WhitelistConfig::default(),
            token_replay: TokenReplayConfig::default(),
            key_protect: KeyProtectConfig::default(),
            m3u8: M3u8Config::default(),
            js_whitelist: JsWhitelistConfig::default(),
            perf: PerfConfig::default(),
            testing: TestingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workers: 0,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            enable_pipeline: true,
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            js_whitelist_secret_key: String::new(),
            api_key: String::new(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: default_backend_mode(),
            filesystem_root: default_filesystem_root(),
            sendfile: true,
            host: default_backend_host(),
            port: default_backend_port(),
            use_https: false,
            ssl_verify: true,
            proxy_host_header: None,
            connect_timeout_ms: default_connect_timeout(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            streaming_threshold: default_streaming_threshold(),
            sendfile_max_chunk: default_sendfile_max_chunk(),
            output_buffers_size: default_output_buffers_size(),
            output_buffers_count: default_output_buffers_count(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: default_session_ttl(),
            user_session_ttl: default_user_session_ttl(),
            cookie_name: default_cookie_name(),
            cookie_httponly: true,
            cookie_secure: false,
            cookie_samesite: default_samesite(),
        }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            ip_access_ttl: default_ip_access_ttl(),
            max_paths_per_cidr: default_max_paths_per_cidr(),
            max_ua_ip_pairs_per_uid: default_max_ua_ip_pairs(),
            fixed_ip_whitelist: vec![],
            enable_static_file_ip_only_check: true,
            static_file_extensions: default_static_file_extensions(),
            fully_allowed_extensions: default_fully_allowed_extensions(),
            legacy_skip_validation_extensions: default_legacy_skip_extensions(),
        }
    }
}

impl Default for TokenReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_uses: 1,
            ttl: default_replay_ttl(),
        }
    }
}

impl Default for KeyProtectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dynamic_m3u8: true,
            max_uses: 1,
            ttl: default_replay_ttl(),
            extensions: default_key_extensions(),
            safe_redirect_enabled: false,
            safe_redirect_base_url: String::new(),
        }
    }
}

impl Default for M3u8Config {
    fn default() -> Self {
        Self {
            content_cache_enabled: true,
            content_cache_ttl: default_m3u8_cache_ttl(),
            single_use_ttl: default_m3u8_single_use_ttl(),
            default_max_access_count: 1,
            enable_browser_adaptive_access: true,
            access_limits: default_m3u8_access_limits(),
            access_window_ttl: default_m3u8_access_window_ttl(),
        }
    }
}

impl Default for JsWhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracker_ttl: default_js_ttl(),
            signature_ttl: default_js_ttl(),
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enable_parallel_validation: true,
            enable_request_deduplication: true,
            enable_response_streaming: true,
        }
    }
}

// Serde default functions

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_redis_pool_size() -> usize {
    100
}

fn default_backend_mode() -> BackendMode {
    BackendMode::Filesystem
}

fn default_filesystem_root() -> PathBuf {
    PathBuf::from("/data")
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    443
}

fn default_connect_timeout() -> u64 {
    8000
}

fn default_max_idle_per_host() -> usize {
    30
}

fn default_streaming_threshold() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_sendfile_max_chunk() -> usize {
    2 * 1024 * 1024 // 2 MiB
}

fn default_output_buffers_size() -> usize {
    32 * 1024 // 32 KiB
}

fn default_output_buffers_count() -> usize {
    4
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64 KiB, sized for 8-second TS segments
}

fn default_session_ttl() -> i64 {
    2 * 60 * 60
}

fn default_user_session_ttl() -> i64 {
    4 * 60 * 60
}

fn default_cookie_name() -> String {
    "session_id_fileserver".to_string()
}

fn default_samesite() -> String {
    "Lax".to_string()
}

fn default_ip_access_ttl() -> i64 {
    60 * 60
}

fn default_max_paths_per_cidr() -> usize {
    3
}

fn default_max_ua_ip_pairs() -> usize {
    5
}

fn default_static_file_extensions() -> Vec<String> {
    [
        ".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js", ".woff", ".woff2", ".ttf",
        ".eot", ".ico", ".txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_fully_allowed_extensions() -> Vec<String> {
    vec![".ts".to_string()]
}

fn default_legacy_skip_extensions() -> Vec<String> {
    [
        ".webp", ".php", ".js", ".css", ".ico", ".txt", ".woff", ".woff2", ".ttf", ".png",
        ".jpg", ".jpeg", ".gif", ".svg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_replay_ttl() -> i64 {
    9600
}

fn default_key_extensions() -> Vec<String> {
    vec![".key".to_string(), "enc.key".to_string()]
}

fn default_m3u8_cache_ttl() -> i64 {
    3600
}

fn default_m3u8_single_use_ttl() -> i64 {
    5 * 60
}

fn default_m3u8_access_limits() -> HashMap<String, HashMap<String, u32>> {
    let mut limits = HashMap::new();

    let mut mobile = HashMap::new();
    for (name, count) in [("qq", 2), ("uc", 1), ("baidu", 1), ("chrome_mobile", 1), ("safari_mobile", 1), ("default", 1)] {
        mobile.insert(name.to_string(), count);
    }
    limits.insert("mobile_browser".to_string(), mobile);

    let mut desktop = HashMap::new();
    for (name, count) in [("chrome", 1), ("firefox", 1), ("edge", 1), ("safari", 1), ("default", 1)] {
        desktop.insert(name.to_string(), count);
    }
    limits.insert("desktop_browser".to_string(), desktop);

    limits.insert(
        "download_tool".to_string(),
        HashMap::from([("default".to_string(), 1)]),
    );
    limits.insert(
        "unknown".to_string(),
        HashMap::from([("default".to_string(), 1)]),
    );

    limits
}

fn default_m3u8_access_window_ttl() -> HashMap<String, i64> {
    HashMap::from([
        ("mobile_browser".to_string(), 3 * 60),
        ("desktop_browser".to_string(), 2 * 60),
        ("download_tool".to_string(), 60),
        ("unknown".to_string(), 60),
    ])
}

fn default_js_ttl() -> i64 {
    60 * 60
}

fn default_true() -> bool {
    true
}

fn default_one() -> i64 {
    1
}

fn default_one_u32() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.listen_addr.port(), 8080);
        assert_eq!(cfg.backend.mode, BackendMode::Filesystem);
        assert_eq!(cfg.whitelist.max_paths_per_cidr, 3);
        assert_eq!(cfg.whitelist.max_ua_ip_pairs_per_uid, 5);
        assert_eq!(cfg.token_replay.max_uses, 1);
        assert_eq!(cfg.key_protect.extensions, vec![".key", "enc.key"]);
        assert_eq!(cfg.streaming.streaming_threshold, 1024 * 1024);
    }

    #[test]
    fn test_protected_key_file_classification() {
        let cfg = GatewayConfig::default();
        assert!(cfg.is_protected_key_file("/video/2025-01-01/xyz/enc.key"));
        assert!(cfg.is_protected_key_file("/video/a/b/other.KEY"));
        assert!(!cfg.is_protected_key_file("/video/a/b/index.m3u8"));
    }

    #[test]
    fn test_key_protect_disabled_disables_classification() {
        let mut cfg = GatewayConfig::default();
        cfg.key_protect.enabled = false;
        assert!(!cfg.is_protected_key_file("/video/enc.key"));
    }

    #[test]
    fn test_skip_validation_uses_fully_allowed_set() {
        let cfg = GatewayConfig::default();
        assert!(cfg.skips_validation("/video/2025-01-01/seg0.ts"));
        assert!(!cfg.skips_validation("/video/2025-01-01/index.m3u8"));
    }

    #[test]
    fn test_skip_validation_legacy_set_when_ip_only_check_off() {
        let mut cfg = GatewayConfig::default();
        cfg.whitelist.enable_static_file_ip_only_check = false;
        assert!(cfg.skips_validation("/static/app.js"));
        assert!(!cfg.skips_validation("/video/seg0.ts"));
    }

    #[test]
    fn test_adaptive_limit_tables() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.m3u8.access_limits["mobile_browser"]["qq"], 2);
        assert_eq!(cfg.m3u8.access_limits["desktop_browser"]["default"], 1);
        assert_eq!(cfg.m3u8.access_window_ttl["mobile_browser"], 180);
    }
}
