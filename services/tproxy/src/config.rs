//! Proxy configuration.
//!
//! The binary forwards every connection to one backend; everything else about
//! a connection is decided by the route.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tproxy_networking::{parse_address, RemoteAddr, DEFAULT_PORT};

use tproxy::proxy::DEFAULT_MAX_CONNECTIONS;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept clients on.
    pub bind_addr: SocketAddr,

    /// Backend every connection is forwarded to.
    pub remote: RemoteAddr,

    /// Upgrade backend connections to TLS.
    pub remote_tls: bool,

    /// Deadline for backend connects.
    pub connect_timeout: Option<Duration>,

    /// Bound on how long a client read may stall.
    pub inactivity_timeout: Option<Duration>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Name shown in the worker status line.
    pub worker_name: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = var("TPROXY_BIND").unwrap_or_else(|| "127.0.0.1:5000".to_string());
        let bind = parse_address(&bind, DEFAULT_PORT).context("TPROXY_BIND is not a valid address.")?;
        let bind_addr = bind
            .socket_addr()
            .with_context(|| format!("TPROXY_BIND must be an IP literal, got {}.", bind))?;

        let remote = var("TPROXY_REMOTE").context("Missing backend. Set TPROXY_REMOTE (host:port).")?;
        let remote = parse_address(&remote, DEFAULT_PORT).context("TPROXY_REMOTE is not a valid address.")?;

        let remote_tls = var("TPROXY_REMOTE_TLS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let connect_timeout = millis(&var, "TPROXY_CONNECT_TIMEOUT_MS")?;
        let inactivity_timeout = millis(&var, "TPROXY_INACTIVITY_TIMEOUT_MS")?;

        let max_connections: usize = var("TPROXY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("TPROXY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let worker_name = var("TPROXY_WORKER_NAME").unwrap_or_else(|| "tproxy".to_string());
        let log_level = var("TPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            remote,
            remote_tls,
            connect_timeout,
            inactivity_timeout,
            max_connections,
            worker_name,
            log_level,
        })
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let value: Option<u64> = var(key)
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{} must be an integer (milliseconds).", key))?;
    Ok(value.map(Duration::from_millis))
}
