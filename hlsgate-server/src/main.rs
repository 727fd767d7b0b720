// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  hlsgate — protected HLS reverse-proxy / file gateway
//
//  Admission:  Redis-backed whitelists, sessions, HMAC tokens,
//              replay counters, key-file gating
//  Delivery:   filesystem or upstream-HTTP streaming with Range
//  Config:     YAML + HLSGATE_* environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use hlsgate_core::config::GatewayConfig;
use hlsgate_proxy::handler::proxy_handler;
use hlsgate_proxy::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hlsgate", version, about = "Protected HLS reverse-proxy / file gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    hlsgate_observability::logger::init(&cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "hlsgate starting");

    let config_path = cli.config.as_ref().and_then(|p| p.to_str().map(str::to_string));
    let config = GatewayConfig::load(config_path.as_deref())?;

    let workers = config.effective_workers();
    info!(workers, "Worker count");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let listen_addr = config.server.listen_addr;
    let state = AppState::build(config).await?;

    // Admin/monitoring routes are exact matches and win over the
    // catch-all proxy route
    let app = Router::new()
        .merge(hlsgate_admin::router())
        .route("/{*path}", get(proxy_handler).head(proxy_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "hlsgate is ready — serving traffic");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("hlsgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping...");
}
