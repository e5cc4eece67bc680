//! Error types for the proxy session.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tproxy_networking::{NetworkError, RemoteAddr};

/// Why a backend connect attempt failed.
#[derive(Debug, Error)]
pub enum ConnectFailure {
    /// The connect deadline elapsed first.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Socket-level failure (resolve, socket, connect).
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure.
    #[error("tls: {0}")]
    Tls(String),
}

/// Backend connect failed or exceeded its deadline.
#[derive(Debug, Error)]
#[error("error while connecting to {remote}: {failure}")]
pub struct ConnectionError {
    pub remote: RemoteAddr,
    pub failure: ConnectFailure,
}

impl ConnectionError {
    pub fn new(remote: &RemoteAddr, failure: impl Into<ConnectFailure>) -> Self {
        Self {
            remote: remote.clone(),
            failure: failure.into(),
        }
    }

    /// Whether the deadline fired rather than the socket failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, ConnectFailure::Timeout(_))
    }
}

/// A command returned by a route could not be used.
#[derive(Debug, Error)]
pub enum CommandError {
    /// `remote` did not parse as an address.
    #[error("invalid remote address: {0}")]
    InvalidAddress(#[from] NetworkError),

    /// A field of the command mapping had the wrong shape.
    #[error("invalid `{key}`: {reason}")]
    InvalidField { key: &'static str, reason: String },

    /// The route itself failed to classify the buffer.
    #[error("route failed: {0}")]
    Route(String),
}

impl CommandError {
    pub(crate) fn field(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            key,
            reason: reason.into(),
        }
    }
}

/// Raised by [`InactivityGuard`](crate::proxy::InactivityGuard) when its deadline elapses.
///
/// Carried inside an `io::Error` of kind `TimedOut`, so a kernel `ETIMEDOUT`
/// can be told apart from the inactivity bound.
#[derive(Debug, Error)]
#[error("inactivity timeout")]
pub struct InactivityElapsed;

impl InactivityElapsed {
    /// Whether `err` was raised by the inactivity deadline.
    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<InactivityElapsed>())
    }
}

impl From<InactivityElapsed> for io::Error {
    fn from(elapsed: InactivityElapsed) -> Self {
        io::Error::new(io::ErrorKind::TimedOut, elapsed)
    }
}

/// Failure taxonomy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    InactivityTimeout,
    Transport,
    Cancelled,
    Interrupted,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection_error",
            ErrorKind::InactivityTimeout => "inactivity_timeout",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Unknown => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Backend connect failed or timed out.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Reads from the client stalled past the inactivity bound.
    #[error("inactivity timeout")]
    InactivityTimeout,

    /// Socket failure while talking to the client (or the backend after connect).
    #[error("socket error: {0}")]
    Transport(#[source] io::Error),

    /// The session task was asked to stop.
    #[error("session cancelled")]
    Cancelled,

    /// An operator interrupt reached the session.
    #[error("interrupted")]
    Interrupted,

    /// Anything else.
    #[error("{0}")]
    Unknown(String),
}

impl SessionError {
    /// Classify an error raised by a client socket read or write.
    pub fn from_client_io(err: io::Error) -> Self {
        if InactivityElapsed::is(&err) {
            return SessionError::InactivityTimeout;
        }
        match err.kind() {
            io::ErrorKind::Interrupted => SessionError::Interrupted,
            _ => SessionError::Transport(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::InactivityTimeout => ErrorKind::InactivityTimeout,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Interrupted => ErrorKind::Interrupted,
            SessionError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether the route's error hook hears about this error.
    ///
    /// Cancellation and interrupts are silent, and unknown errors are only logged.
    pub fn is_reported(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::InactivityTimeout | ErrorKind::Transport
        )
    }
}

impl From<CommandError> for SessionError {
    fn from(err: CommandError) -> Self {
        SessionError::Unknown(err.to_string())
    }
}
