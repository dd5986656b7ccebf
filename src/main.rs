mod cache;
mod config;
mod coordination;
mod git;
mod health;
mod http;
mod identity;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheManager, GitMirrorStore, MirrorStore};
use crate::config::Config;
use crate::git::upload_pack::{GitUploadPack, UploadPack};
use crate::http::bridge::Bridge;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitcache", about = "Caching proxy for Git smart-HTTP fetches")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply without one.
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Cache root, overriding `storage.cache_root`.
    #[arg(short, long)]
    cache_dir: Option<PathBuf>,

    /// Listen on `0.0.0.0:<port>`, overriding `proxy.http_listen`.
    #[arg(short, long)]
    port: Option<u16>,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => Config::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.storage.cache_root = dir.clone();
        }
        if let Some(port) = self.port {
            config.proxy.http_listen = format!("0.0.0.0:{port}");
        }
        config::validate_config(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub cache: CacheManager,
    pub bridge: Bridge,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn MirrorStore>,
        upload_pack: Arc<dyn UploadPack>,
        metrics: MetricsRegistry,
    ) -> Self {
        let cache = CacheManager::new(
            store,
            &config.cache,
            config.upstream.scheme,
            metrics.clone(),
        );
        let bridge = Bridge::new(upload_pack, metrics.clone());
        Self {
            config: Arc::new(config),
            metrics,
            cache,
            bridge,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = cli.load_config()?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = ?cli.config,
        cache_root = %config.storage.cache_root.display(),
        upstream_scheme = config.upstream.scheme.as_str(),
        "starting gitcache"
    );

    // ---- Mirror store ----
    let store = GitMirrorStore::new(&config.storage.cache_root, config.cache.sync_timeout());
    store.prepare_root().await.with_context(|| {
        format!("failed to prepare cache root: {}", store.root().display())
    })?;
    let mirrors = store
        .list_mirrors()
        .context("failed to scan existing mirrors")?;
    tracing::info!(mirrors = mirrors.len(), "mirror store ready");

    // ---- Upload-pack ----
    let upload_pack = GitUploadPack::new(&config.upload_pack);
    tracing::info!(program = %upload_pack.program().display(), "upload-pack configured");

    // ---- App state ----
    let state = Arc::new(AppState::new(
        config,
        Arc::new(store),
        Arc::new(upload_pack),
        MetricsRegistry::new(),
    ));

    run_http_server(state).await?;

    tracing::info!("gitcache shut down cleanly");
    Ok(())
}
