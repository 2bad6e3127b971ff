//! vmio daemon
//!
//! Serves the authenticated data plane for disk image transfers: a
//! remote TCP service, an optional local Unix-socket service for
//! clients on the same host, and a control service carrying the
//! tickets API.

mod checksum;
mod config;
mod errors;
mod extents;
mod images;
mod range;
mod routes;
mod state;
#[cfg(test)]
mod tests;
mod tickets;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::{AppState, SharedState};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "vmio-daemon", about = "vmio data-plane daemon")]
struct Args {
    /// Remote service bind host
    #[arg(long, default_value = "::")]
    host: String,

    /// Remote service bind port
    #[arg(long, default_value_t = 54322)]
    port: u16,

    /// Sort IPv4 addresses first when resolving the bind host
    #[arg(long)]
    prefer_ipv4: bool,

    /// Local data service socket; empty disables the local service
    #[arg(long, default_value = "/run/vmio/vmio.sock")]
    local_socket: PathBuf,

    /// Disable the local data service
    #[arg(long)]
    no_local_service: bool,

    /// Control service socket (tickets API)
    #[arg(long, default_value = "/run/vmio/control.sock")]
    control_socket: PathBuf,

    /// Connections allowed per backend
    #[arg(long, default_value_t = 8)]
    max_connections: u32,

    /// CA bundle used when proxying to remote daemons
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::default();
        config.remote.host = self.host;
        config.remote.port = self.port;
        config.remote.prefer_ipv4 = self.prefer_ipv4;
        config.local.enable = !self.no_local_service;
        config.local.socket = self.local_socket;
        config.control.socket = self.control_socket;
        config.daemon.max_connections = self.max_connections;
        config.backend_http.ca_file = self.ca_file;
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting vmio daemon");

    let config = args.into_config();
    let state = AppState::new(config.clone());

    // ── Remote data service ───────────────────────────────────────────────────
    let remote_listener = bind_remote(&config).await?;
    info!("remote service on {}", remote_listener.local_addr()?);
    let remote = tokio::spawn(serve_tcp(remote_listener, state.clone()));

    // ── Local data service ────────────────────────────────────────────────────
    let local = if config.local.enable {
        let listener = bind_unix(&config.local.socket)?;
        info!("local service on {:?}", config.local.socket);
        Some(tokio::spawn(serve_unix(
            listener,
            routes::data_router(state.clone()),
        )))
    } else {
        None
    };

    // ── Control service ───────────────────────────────────────────────────────
    let control_listener = bind_unix(&config.control.socket)?;
    info!("control service on {:?}", config.control.socket);
    let control = tokio::spawn(serve_unix(
        control_listener,
        routes::control_router(state.clone()),
    ));

    // ── Expired ticket sweeper ────────────────────────────────────────────────
    {
        let state = state.clone();
        let interval = config.daemon.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.auth.sweep();
            }
        });
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    remote.abort();
    control.abort();
    if let Some(local) = local {
        local.abort();
        let _ = std::fs::remove_file(&config.local.socket);
    }
    let _ = std::fs::remove_file(&config.control.socket);

    Ok(())
}

/// Resolve and bind the remote service address. With `prefer_ipv4`,
/// IPv4 addresses are tried first.
async fn bind_remote(config: &Config) -> Result<TcpListener> {
    let mut addrs: Vec<SocketAddr> =
        tokio::net::lookup_host((config.remote.host.as_str(), config.remote.port))
            .await
            .with_context(|| format!("resolving {:?}", config.remote.host))?
            .collect();

    if config.remote.prefer_ipv4 {
        addrs.sort_by_key(|addr| !addr.is_ipv4());
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("no address resolved for {:?}", config.remote.host)))
}

/// Bind a Unix socket, unlinking a stale path first.
fn bind_unix(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {parent:?}"))?;
    }
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("unlinking stale socket {path:?}"))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {path:?}"))
}

async fn serve_tcp(listener: TcpListener, state: SharedState) {
    if let Err(err) = axum::serve(listener, routes::data_router(state)).await {
        tracing::error!("remote service failed: {err}");
    }
}

async fn serve_unix(listener: UnixListener, router: axum::Router) {
    if let Err(err) = axum::serve(listener, router).await {
        tracing::error!("unix service failed: {err}");
    }
}
