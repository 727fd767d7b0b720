//! Process-wide state, constructed once at startup and handed to
//! every handler through axum state.

use crate::transfer::TransferTracker;
use crate::upstream::UpstreamClient;
use hlsgate_core::config::{BackendMode, GatewayConfig};
use hlsgate_gate::admission::AdmissionPipeline;
use hlsgate_gate::validate::ValidationCoordinator;
use hlsgate_observability::MetricsCollector;
use hlsgate_store::access_log::LogWriter;
use hlsgate_store::js_whitelist::JsWhitelistStore;
use hlsgate_store::key_protect::KeyProtectStore;
use hlsgate_store::replay::ReplayStore;
use hlsgate_store::session::SessionStore;
use hlsgate_store::whitelist::WhitelistStore;
use hlsgate_store::RedisStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: RedisStore,
    pub whitelist: WhitelistStore,
    pub sessions: SessionStore,
    pub js_whitelist: JsWhitelistStore,
    pub replay: ReplayStore,
    pub key_protect: KeyProtectStore,
    pub logs: LogWriter,
    pub pipeline: Arc<AdmissionPipeline>,
    pub tracker: TransferTracker,
    pub upstream: Option<UpstreamClient>,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Connect the store, build every service, and wire the pipeline.
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
        let store = RedisStore::connect(&config.redis.url, config.redis.enable_pipeline).await?;
        let logs = LogWriter::spawn(store.clone());

        let whitelist = WhitelistStore::new(store.clone());
        let sessions = SessionStore::new(store.clone());
        let js_whitelist = JsWhitelistStore::new(store.clone());
        let replay = ReplayStore::new(store.clone(), logs.clone());
        let key_protect = KeyProtectStore::new(store.clone(), logs.clone());

        let coordinator = Arc::new(ValidationCoordinator::new(whitelist.clone(), sessions.clone()));
        let pipeline = Arc::new(AdmissionPipeline::new(
            coordinator,
            whitelist.clone(),
            js_whitelist.clone(),
            replay.clone(),
            key_protect.clone(),
            logs.clone(),
        ));

        let upstream = match config.backend.mode {
            BackendMode::Http => {
                let client = UpstreamClient::new(&config.backend)?;
                info!(host = %config.backend.host, port = config.backend.port, "Upstream HTTP backend");
                Some(client)
            }
            BackendMode::Filesystem => {
                if !config.backend.filesystem_root.exists() {
                    warn!(root = %config.backend.filesystem_root.display(), "Filesystem root does not exist");
                } else {
                    info!(root = %config.backend.filesystem_root.display(), "Filesystem backend");
                }
                None
            }
        };

        let metrics = Arc::new(MetricsCollector::new()?);

        Ok(Self {
            config: Arc::new(config),
            store,
            whitelist,
            sessions,
            js_whitelist,
            replay,
            key_protect,
            logs,
            pipeline,
            tracker: TransferTracker::new(),
            upstream,
            metrics,
            started_at: chrono::Utc::now(),
        })
    }
}
