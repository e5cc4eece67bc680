//! TCP listener and connection handling.
//!
//! Accepts client connections, bounds how many run at once, and drives one
//! [`Session`] per connection on its own task. Shutdown stops accepting,
//! cancels every running session and waits for their cleanup to finish.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::inactivity::InactivityGuard;
use super::route::Route;
use super::session::{Session, SessionSummary};
use super::worker::ConnectionTracker;
use crate::error::ErrorKind;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Bound on how long a client read may stall.
    pub inactivity_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            inactivity_timeout: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Total sessions finished.
    pub connections_closed: AtomicU64,
    /// Sessions that reached a backend.
    pub forwarded: AtomicU64,
    pub connection_errors: AtomicU64,
    pub inactivity_timeouts: AtomicU64,
    pub transport_errors: AtomicU64,
    /// Cancelled or interrupted sessions.
    pub cancelled: AtomicU64,
    pub unknown_errors: AtomicU64,
    /// Bytes read from clients.
    pub bytes_received: AtomicU64,
}

impl ListenerStats {
    fn record(&self, summary: &SessionSummary) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(summary.bytes_received, Ordering::Relaxed);

        if summary.established {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }

        let counter = match summary.error {
            None => return,
            Some(ErrorKind::Connection) => &self.connection_errors,
            Some(ErrorKind::InactivityTimeout) => &self.inactivity_timeouts,
            Some(ErrorKind::Transport) => &self.transport_errors,
            Some(ErrorKind::Cancelled | ErrorKind::Interrupted) => &self.cancelled,
            Some(ErrorKind::Unknown) => &self.unknown_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A TCP listener feeding client connections to sessions.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Classifier shared by every session.
    route: Arc<dyn Route>,
    /// Worker accounting shared by every session.
    tracker: ConnectionTracker,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        route: Arc<dyn Route>,
        tracker: ConnectionTracker,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            inactivity_timeout = ?config.inactivity_timeout,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            route,
            tracker,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until `shutdown` is cancelled, then wait for open sessions.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let sessions = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let session_shutdown = shutdown.child_token();

                    sessions.spawn(
                        async move {
                            let summary = listener
                                .handle_connection(stream, peer_addr, session_shutdown)
                                .await;
                            listener.stats.record(&summary);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        sessions.close();
        info!(open_sessions = sessions.len(), "Listener stopping");
        sessions.wait().await;
        info!(status = %self.tracker.status(), "Listener stopped");

        Ok(())
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> SessionSummary {
        if let Err(e) = client.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(peer_addr = %peer_addr, "Handling connection");

        let route = Arc::clone(&self.route);
        let tracker = self.tracker.clone();

        match self.config.inactivity_timeout {
            Some(limit) => {
                Session::new(InactivityGuard::new(client, limit), peer_addr, route, tracker)
                    .with_shutdown(shutdown)
                    .run()
                    .await
            }
            None => {
                Session::new(client, peer_addr, route, tracker)
                    .with_shutdown(shutdown)
                    .run()
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::command::Command;
    use crate::proxy::worker::WorkerStatus;
    use crate::proxy::session::SessionState;
    use tproxy_networking::RemoteAddr;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:5000".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.inactivity_timeout.is_none());
    }

    #[test]
    fn test_stats_record_by_kind() {
        let stats = ListenerStats::default();
        let summary = SessionSummary {
            peer: "127.0.0.1:1".parse().unwrap(),
            state: SessionState::Connecting,
            remote: Some(RemoteAddr::new("10.0.0.1", 80)),
            established: false,
            error: Some(ErrorKind::Connection),
            bytes_received: 12,
        };

        stats.record(&summary);
        stats.record(&SessionSummary {
            error: Some(ErrorKind::Cancelled),
            ..summary.clone()
        });
        stats.record(&SessionSummary {
            error: Some(ErrorKind::Transport),
            ..summary.clone()
        });

        assert_eq!(stats.connections_closed.load(Ordering::Relaxed), 3);
        assert_eq!(stats.connection_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(stats.transport_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_received.load(Ordering::Relaxed), 36);
        assert_eq!(stats.forwarded.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let route: Arc<dyn Route> = Arc::new(|_: &[u8]| -> Result<Command, crate::error::CommandError> {
            Ok(Command::NoOp)
        });
        let tracker = ConnectionTracker::new(WorkerStatus::new("test"));
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Arc::new(Listener::bind(config, route, tracker.clone()).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&listener).run(shutdown.clone()));

        // An idle client keeps its session open until shutdown cancels it.
        let _client = TcpStream::connect(addr).await.unwrap();
        while tracker.active() == 0 {
            tokio::task::yield_now().await;
        }

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(tracker.active(), 0);
        assert_eq!(listener.stats().cancelled.load(Ordering::Relaxed), 1);
    }
}
