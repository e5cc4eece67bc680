pub mod error;
pub mod proxy;

pub use error::{
    CommandError, ConnectFailure, ConnectionError, ErrorKind, InactivityElapsed, SessionError,
};
pub use proxy::{
    Command, ConnectionTracker, Forward, JsonRoute, Listener, ListenerConfig, Payload, Route,
    SendFile, Session, SessionState, StaticRoute, TlsOptions, WorkerStatus,
};
pub use tproxy_networking::{parse_address, RemoteAddr};
