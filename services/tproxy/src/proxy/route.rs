//! Route: the pluggable classifier behind every session.
//!
//! A route is stateless across calls. It sees the whole buffer each time and
//! decides from scratch.

use std::time::Duration;

use serde_json::Value;
use tproxy_networking::RemoteAddr;

use super::command::{Command, Forward, TlsOptions};
use super::session::SessionInfo;
use crate::error::{CommandError, SessionError};

pub trait Route: Send + Sync {
    /// Classify the bytes received so far.
    fn decide(&self, buffered: &[u8]) -> Result<Command, CommandError>;

    /// Called for connection, inactivity, and transport errors.
    fn on_error(&self, _session: &SessionInfo<'_>, _error: &SessionError) {}

    /// After connecting, send the buffer to the backend and relay one chunk of the answer.
    fn flush_buffer_on_connect(&self) -> bool {
        false
    }
}

impl<F> Route for F
where
    F: Fn(&[u8]) -> Result<Command, CommandError> + Send + Sync,
{
    fn decide(&self, buffered: &[u8]) -> Result<Command, CommandError> {
        self(buffered)
    }
}

/// Forwards every connection to one backend as soon as the first bytes arrive.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    remote: RemoteAddr,
    tls: Option<TlsOptions>,
    connect_timeout: Option<Duration>,
    inactivity_timeout: Option<Duration>,
}

impl StaticRoute {
    pub fn new(remote: RemoteAddr) -> Self {
        Self {
            remote,
            tls: None,
            connect_timeout: None,
            inactivity_timeout: None,
        }
    }

    pub fn with_tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

impl Route for StaticRoute {
    fn decide(&self, _buffered: &[u8]) -> Result<Command, CommandError> {
        let mut forward = Forward::new(self.remote.clone());
        if let Some(options) = &self.tls {
            forward = forward.with_tls(options.clone());
        }
        forward.connect_timeout = self.connect_timeout;
        forward.inactivity_timeout = self.inactivity_timeout;
        Ok(Command::Forward(forward))
    }

    fn flush_buffer_on_connect(&self) -> bool {
        true
    }
}

/// Adapts a classifier that answers with dict-shaped commands.
///
/// See [`Command::from_value`] for the accepted mapping.
pub struct JsonRoute<F> {
    decide: F,
    flush_buffer_on_connect: bool,
}

impl<F> JsonRoute<F>
where
    F: Fn(&[u8]) -> Value + Send + Sync,
{
    pub fn new(decide: F) -> Self {
        Self {
            decide,
            flush_buffer_on_connect: false,
        }
    }

    pub fn flush_on_connect(mut self, enabled: bool) -> Self {
        self.flush_buffer_on_connect = enabled;
        self
    }
}

impl<F> Route for JsonRoute<F>
where
    F: Fn(&[u8]) -> Value + Send + Sync,
{
    fn decide(&self, buffered: &[u8]) -> Result<Command, CommandError> {
        Command::from_value((self.decide)(buffered))
    }

    fn flush_buffer_on_connect(&self) -> bool {
        self.flush_buffer_on_connect
    }
}
