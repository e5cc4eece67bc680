//! Per-connection session.
//!
//! A session reads from the client in chunks of [`READ_CHUNK_SIZE`], appends
//! each chunk to its buffer and asks the route to classify the whole buffer.
//! The first command other than [`Command::NoOp`] is dispatched and ends the
//! read loop. Whatever happens, the session ends in the same cleanup: the
//! connection is counted out and the client socket is shut down.
//!
//! ```text
//! Accepting -> Deciding -+-> Connecting -> Forwarded
//!                        +-> FileSent
//!                        +-> ClosedWithReply
//!                        +-> ClosedNoReply
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tproxy_networking::RemoteAddr;
use tracing::{debug, error, trace, warn};

use super::command::{Command, FileSource, Forward, SendFile};
use super::connector;
use super::route::Route;
use super::transfer::{send_data, ClientSocket, Payload};
use super::worker::ConnectionTracker;
use crate::error::{ErrorKind, SessionError};

/// Maximum number of bytes taken from the client per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepting,
    Deciding,
    Connecting,
    Forwarded,
    FileSent,
    ClosedWithReply,
    ClosedNoReply,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SessionState::Accepting | SessionState::Deciding | SessionState::Connecting
        )
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    /// Last state reached; not terminal when the session ended on an error.
    pub state: SessionState,
    pub remote: Option<RemoteAddr>,
    pub established: bool,
    pub error: Option<ErrorKind>,
    pub bytes_received: u64,
}

/// Read-only view of a session handed to [`Route::on_error`].
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo<'a> {
    pub peer: SocketAddr,
    pub remote: Option<&'a RemoteAddr>,
    pub state: SessionState,
    pub buffered: &'a [u8],
}

/// Client bytes not yet handed to a backend.
///
/// Keeps the chunks as received and a joined copy for the route.
#[derive(Debug, Default)]
struct Buffer {
    chunks: Vec<Bytes>,
    joined: BytesMut,
}

impl Buffer {
    fn push(&mut self, chunk: Bytes) {
        self.joined.extend_from_slice(&chunk);
        self.chunks.push(chunk);
    }

    fn as_slice(&self) -> &[u8] {
        &self.joined
    }

    fn replace(&mut self, data: Bytes) {
        self.chunks.clear();
        self.joined.clear();
        if !data.is_empty() {
            self.push(data);
        }
    }

    fn take(&mut self) -> Vec<Bytes> {
        self.joined.clear();
        std::mem::take(&mut self.chunks)
    }

    fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }
}

/// One accepted client connection.
pub struct Session<S> {
    client: S,
    peer: SocketAddr,
    route: Arc<dyn Route>,
    tracker: ConnectionTracker,
    shutdown: CancellationToken,
    buffer: Buffer,
    remote: Option<RemoteAddr>,
    established: bool,
    state: SessionState,
    bytes_received: u64,
}

impl<S: ClientSocket> Session<S> {
    pub fn new(client: S, peer: SocketAddr, route: Arc<dyn Route>, tracker: ConnectionTracker) -> Self {
        Self {
            client,
            peer,
            route,
            tracker,
            shutdown: CancellationToken::new(),
            buffer: Buffer::default(),
            remote: None,
            established: false,
            state: SessionState::Accepting,
            bytes_received: 0,
        }
    }

    /// Stop the session when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn info(&self) -> SessionInfo<'_> {
        SessionInfo {
            peer: self.peer,
            remote: self.remote.as_ref(),
            state: self.state,
            buffered: self.buffer.as_slice(),
        }
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionSummary {
        let guard = self.tracker.enter();

        let error = match self.serve().await {
            Ok(()) => None,
            Err(err) => {
                self.report(&err);
                Some(err.kind())
            }
        };

        if let Some(remote) = &self.remote {
            debug!(remote = %remote, established = self.established, "Closing remote");
        }

        drop(guard);
        // The client may already be gone; closing must not fail the session.
        let _ = self.client.shutdown().await;

        debug!(state = ?self.state, bytes_received = self.bytes_received, "Session closed");

        SessionSummary {
            peer: self.peer,
            state: self.state,
            remote: self.remote,
            established: self.established,
            error,
            bytes_received: self.bytes_received,
        }
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let shutdown = self.shutdown.clone();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(SessionError::Cancelled),
                read = self.client.read(&mut chunk) => read.map_err(SessionError::from_client_io)?,
            };

            if n == 0 {
                trace!(buffered = self.buffer.as_slice().len(), "Client disconnected");
                self.state = SessionState::ClosedNoReply;
                return Ok(());
            }

            self.bytes_received += n as u64;
            self.buffer.push(Bytes::copy_from_slice(&chunk[..n]));

            self.state = SessionState::Deciding;
            let command = match self.route.decide(self.buffer.as_slice())? {
                Command::NoOp => continue,
                command => command,
            };

            return tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(SessionError::Cancelled),
                result = self.dispatch(command) => result,
            };
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Forward(forward) => self.forward(forward).await,
            Command::Close { reply: Some(reply) } | Command::ReplyAndClose { reply } => {
                self.reply(reply).await?;
                self.state = SessionState::ClosedWithReply;
                Ok(())
            }
            Command::Close { reply: None } => {
                self.state = SessionState::ClosedNoReply;
                Ok(())
            }
            Command::SendFile(send) => self.send_file(send).await,
            Command::Unrecognized | Command::NoOp => {
                debug!("Route returned no usable command, closing");
                self.state = SessionState::ClosedNoReply;
                Ok(())
            }
        }
    }

    async fn forward(&mut self, mut forward: Forward) -> Result<(), SessionError> {
        if let Some(data) = forward.data.take() {
            self.buffer.replace(data);
        }
        if let Some(reply) = forward.reply.take() {
            self.reply(reply).await?;
        }

        self.remote = Some(forward.remote.clone());
        self.state = SessionState::Connecting;

        let mut backend = connector::connect(&forward).await?;

        if self.route.flush_buffer_on_connect() && !self.buffer.is_empty() {
            let response = backend
                .exchange_once(self.buffer.take())
                .await
                .map_err(SessionError::Transport)?;
            if !response.is_empty() {
                self.reply(Payload::Bytes(response)).await?;
            }
        }

        self.established = true;
        self.state = SessionState::Forwarded;

        debug!(
            remote = %backend.remote,
            tls = backend.stream.is_tls(),
            inactivity_timeout = ?backend.inactivity_timeout,
            extra = ?backend.extra,
            "Backend connected"
        );

        Ok(())
    }

    async fn send_file(&mut self, send: SendFile) -> Result<(), SessionError> {
        let file = match send.source {
            FileSource::Path(path) => tokio::fs::File::open(&path).await.map_err(|e| {
                SessionError::Unknown(format!("cannot open {}: {}", path.display(), e))
            })?,
            FileSource::Descriptor(file) => tokio::fs::File::from_std(file),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| SessionError::Unknown(format!("cannot stat file: {}", e)))?
            .len();
        let length = send
            .length
            .unwrap_or_else(|| size.saturating_sub(send.offset));

        if let Some(reply) = send.reply {
            self.reply(reply).await?;
        }

        let sent = self
            .client
            .send_file(file.into_std().await, send.offset, length)
            .await
            .map_err(SessionError::from_client_io)?;

        self.state = SessionState::FileSent;
        debug!(offset = send.offset, length, sent, "File sent");

        Ok(())
    }

    async fn reply(&mut self, payload: Payload) -> Result<(), SessionError> {
        send_data(&mut self.client, payload)
            .await
            .map_err(SessionError::from_client_io)
    }

    fn report(&self, err: &SessionError) {
        let remote = self.remote.as_ref().map(ToString::to_string);

        match err.kind() {
            ErrorKind::Cancelled | ErrorKind::Interrupted => {
                debug!(reason = err.reason_code(), "Session stopped");
            }
            ErrorKind::InactivityTimeout => {
                warn!(remote = ?remote, state = ?self.state, "Client inactivity timeout");
            }
            ErrorKind::Unknown => {
                error!(error = %err, state = ?self.state, "Unexpected session error");
            }
            ErrorKind::Connection | ErrorKind::Transport => {
                error!(
                    error = %err,
                    reason = err.reason_code(),
                    remote = ?remote,
                    "Session failed"
                );
            }
        }

        if err.is_reported() {
            self.route.on_error(&self.info(), err);
        }
    }
}
