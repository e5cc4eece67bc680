//! Intercepting TCP proxy implementation.
//!
//! This module provides:
//! - TCP listener management
//! - The per-connection session state machine
//! - The route contract and the commands it returns
//! - Backend connection with deadline and optional TLS upgrade
//! - Reply and file transfer helpers
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> Route.decide(buffer)
//!                          |
//!                          +-> Forward       -> Connector -> Backend
//!                          +-> SendFile      -> sendfile(2)
//!                          +-> Close / ReplyAndClose
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tproxy::proxy::{ConnectionTracker, Listener, ListenerConfig, StaticRoute, WorkerStatus};
//!
//! let route = Arc::new(StaticRoute::new("10.0.0.2:8080".parse()?));
//! let tracker = ConnectionTracker::new(WorkerStatus::new("tproxy"));
//!
//! let config = ListenerConfig::new("127.0.0.1:5000".parse()?);
//! let listener = Arc::new(Listener::bind(config, route, tracker).await?);
//! listener.run(CancellationToken::new()).await?;
//! ```

mod command;
mod connector;
mod inactivity;
mod listener;
mod route;
mod session;
mod transfer;
mod worker;

pub use command::{CertRequirement, Command, FileSource, Forward, SendFile, TlsOptions};
pub use connector::{connect, BackendConnection, BackendStream, BACKEND_READ_SIZE};
pub use inactivity::InactivityGuard;
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use route::{JsonRoute, Route, StaticRoute};
pub use session::{Session, SessionInfo, SessionState, SessionSummary, READ_CHUNK_SIZE};
pub use transfer::{copy_file_window, send_data, ClientSocket, Payload, StreamSource};
pub use worker::{ActiveGuard, ConnectionTracker, Worker, WorkerStatus};
