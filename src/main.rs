mod auth;
mod cache;
mod config;
mod error;
mod http;
mod merge;
mod persist;
mod service;
mod store;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::AdminCredentials;
use crate::cache::FreshnessCache;
use crate::config::{Config, RuntimeConfig};
use crate::service::DirectoryService;
use crate::store::MetaStore;
use crate::upstream::client::ProxyManagerApi;
use crate::upstream::lister::HostLister;
use crate::upstream::session::SessionManager;
use crate::upstream::UpstreamApi;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "proxydash", about = "Reverse-proxy host directory with a local metadata overlay")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/proxydash/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<DirectoryService>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .listen
        .parse()
        .context("invalid listen address")?;

    let app = http::handler::create_router(Arc::clone(&state))?;

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
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);
    tracing::info!(config_path = %cli.config, "starting proxydash");

    // ---- Runtime (admin-mutable) settings ----
    let runtime = Arc::new(RuntimeConfig::load(
        config.runtime_config_file.clone(),
        &config.upstream.base_url,
    )?);
    tracing::info!(base_url = %runtime.base_url().await, "upstream control plane configured");

    // ---- Upstream session ----
    let api: Arc<dyn UpstreamApi> = Arc::new(ProxyManagerApi::new(
        Arc::clone(&runtime),
        Duration::from_secs(config.upstream.timeout_secs),
    )?);

    let bootstrap = bootstrap_credentials(&config);
    if bootstrap.is_none() {
        tracing::info!(
            identity_env = %config.upstream.identity_env,
            "no bootstrap upstream credentials in the environment; \
             waiting for an explicit token renewal"
        );
    }
    let session = Arc::new(SessionManager::new(Arc::clone(&api), bootstrap));

    // ---- Freshness cache ----
    let lister = HostLister::new(api, Arc::clone(&session));
    let cache = FreshnessCache::new(
        lister,
        Duration::from_secs(config.cache.max_age_secs),
        config.cache.snapshot_file.clone(),
    );

    // ---- Override store ----
    let store = MetaStore::load(&config.meta_file)?;

    // ---- Administrator credentials ----
    let admin = AdminCredentials::from_env(&config.admin.identity_env, &config.admin.secret_env);
    if admin.is_none() {
        tracing::warn!(
            identity_env = %config.admin.identity_env,
            secret_env = %config.admin.secret_env,
            "administrator credentials not configured; privileged routes disabled"
        );
    }

    // ---- Directory service ----
    let directory = DirectoryService::new(cache, store, session, Arc::clone(&runtime), admin);

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        directory: Arc::new(directory),
    });

    run_http_server(state).await?;

    tracing::info!("proxydash shut down cleanly");
    Ok(())
}

fn bootstrap_credentials(config: &Config) -> Option<(String, String)> {
    let identity = std::env::var(&config.upstream.identity_env)
        .ok()
        .filter(|v| !v.is_empty())?;
    let secret = std::env::var(&config.upstream.secret_env)
        .ok()
        .filter(|v| !v.is_empty())?;
    Some((identity, secret))
}
