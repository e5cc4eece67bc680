//! tproxy
//!
//! Intercepting TCP proxy.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Buffers client bytes until the route decides what to do
//! - Forwards to the configured backend, optionally over TLS
//! - Keeps a worker status line with the active connection count

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tproxy::proxy::{ConnectionTracker, Listener, ListenerConfig, StaticRoute, TlsOptions, WorkerStatus};

mod config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tproxy");
    info!(
        bind_addr = %config.bind_addr,
        remote = %config.remote,
        remote_tls = config.remote_tls,
        connect_timeout = ?config.connect_timeout,
        inactivity_timeout = ?config.inactivity_timeout,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let mut route = StaticRoute::new(config.remote.clone())
        .with_connect_timeout(config.connect_timeout)
        .with_inactivity_timeout(config.inactivity_timeout);
    if config.remote_tls {
        route = route.with_tls(TlsOptions::default());
    }

    let tracker = ConnectionTracker::new(WorkerStatus::new(config.worker_name.clone()));

    let mut listener_config = ListenerConfig::new(config.bind_addr);
    listener_config.max_connections = config.max_connections;
    listener_config.inactivity_timeout = config.inactivity_timeout;

    let listener = Listener::bind(listener_config, Arc::new(route), tracker)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.bind_addr))?;
    let listener = Arc::new(listener);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal_shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    listener.run(shutdown).await?;

    info!("tproxy stopped");
    Ok(())
}
