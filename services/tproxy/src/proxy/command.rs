//! Commands returned by a route.
//!
//! A route looks at the bytes buffered so far and answers with one
//! [`Command`]. Besides the typed API, commands can be decoded from the
//! dict-shaped mapping dynamic routes produce (see [`Command::from_value`]):
//!
//! | key                    | meaning                                   |
//! |------------------------|-------------------------------------------|
//! | `remote`               | forward to this backend                   |
//! | `data`                 | replaces the pending outbound buffer      |
//! | `reply`                | sent to the client before the action      |
//! | `ssl`, `ssl_args`      | TLS upgrade of the backend connection     |
//! | `extra`                | opaque value for the relay                |
//! | `connect_timeout`      | bound on the backend connect (seconds)    |
//! | `inactivity_timeout`   | bound handed to the relay (seconds)       |
//! | `close`                | close, with the value as reply if a string|
//! | `file`                 | send this file                            |
//! | `offset`, `nbytes`     | file window                               |
//! | `reply-only-and-close` | send the value, then close                |

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use tproxy_networking::{parse_address, RemoteAddr, DEFAULT_PORT};

use super::transfer::Payload;
use crate::error::CommandError;

/// Decision returned by a route.
#[derive(Debug)]
pub enum Command {
    /// Connect to a backend.
    Forward(Forward),
    /// Close the client, optionally after a reply.
    Close { reply: Option<Payload> },
    /// Send (part of) a file to the client, then close.
    SendFile(SendFile),
    /// Send a reply, then close.
    ReplyAndClose { reply: Payload },
    /// Not enough data yet; keep buffering.
    NoOp,
    /// The route answered with something that is not a command. Closes without a reply.
    Unrecognized,
}

impl Command {
    pub fn close() -> Self {
        Command::Close { reply: None }
    }

    pub fn close_with(reply: impl Into<Payload>) -> Self {
        Command::Close {
            reply: Some(reply.into()),
        }
    }

    pub fn reply_and_close(reply: impl Into<Payload>) -> Self {
        Command::ReplyAndClose {
            reply: reply.into(),
        }
    }

    /// Decode a dict-shaped command.
    ///
    /// `null` keeps buffering; a mapping picks the first of `remote`, `close`,
    /// `file`, `reply-only-and-close` it contains; anything else is
    /// [`Command::Unrecognized`].
    pub fn from_value(value: Value) -> Result<Self, CommandError> {
        let map = match value {
            Value::Null => return Ok(Command::NoOp),
            Value::Object(map) => map,
            _ => return Ok(Command::Unrecognized),
        };

        if map.contains_key("remote") {
            Forward::from_map(map).map(Command::Forward)
        } else if let Some(close) = map.get("close") {
            Ok(Command::Close {
                reply: match close {
                    Value::String(text) => Some(Payload::Bytes(Bytes::from(text.clone()))),
                    _ => None,
                },
            })
        } else if map.contains_key("file") {
            SendFile::from_map(map).map(Command::SendFile)
        } else if let Some(reply) = map.get("reply-only-and-close") {
            Ok(Command::ReplyAndClose {
                reply: payload_from_value("reply-only-and-close", reply)?,
            })
        } else {
            Ok(Command::Unrecognized)
        }
    }
}

/// Connect to a backend.
#[derive(Debug)]
pub struct Forward {
    pub remote: RemoteAddr,
    /// Replaces the bytes buffered from the client.
    pub data: Option<Bytes>,
    /// Sent to the client before connecting.
    pub reply: Option<Payload>,
    pub tls: bool,
    pub tls_options: TlsOptions,
    /// Opaque value for the relay that takes over the backend.
    pub extra: Option<Value>,
    pub connect_timeout: Option<Duration>,
    /// Handed to the relay; not enforced while connecting.
    pub inactivity_timeout: Option<Duration>,
}

impl Forward {
    pub fn new(remote: RemoteAddr) -> Self {
        Self {
            remote,
            data: None,
            reply: None,
            tls: false,
            tls_options: TlsOptions::default(),
            extra: None,
            connect_timeout: None,
            inactivity_timeout: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_reply(mut self, reply: impl Into<Payload>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_tls(mut self, options: TlsOptions) -> Self {
        self.tls = true;
        self.tls_options = options;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, CommandError> {
        let remote = match map.get("remote") {
            Some(Value::String(netloc)) => parse_address(netloc, DEFAULT_PORT)?,
            Some(Value::Array(pair)) => remote_from_pair(pair)?,
            _ => {
                return Err(CommandError::field(
                    "remote",
                    "expected \"host:port\" or [host, port]",
                ))
            }
        };

        let data = match map.get("data") {
            None | Some(Value::Null) => None,
            Some(value) => Some(bytes_from_value("data", value)?),
        };

        let reply = optional_payload(&map, "reply")?;

        let tls = match map.get("ssl") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return Err(CommandError::field("ssl", "expected a boolean")),
        };

        let tls_options = match map.get("ssl_args") {
            None | Some(Value::Null) => TlsOptions::default(),
            Some(args) => serde_json::from_value(args.clone())
                .map_err(|e| CommandError::field("ssl_args", e.to_string()))?,
        };

        Ok(Self {
            remote,
            data,
            reply,
            tls,
            tls_options,
            extra: map.get("extra").filter(|v| !v.is_null()).cloned(),
            connect_timeout: duration_from_map(&map, "connect_timeout")?,
            inactivity_timeout: duration_from_map(&map, "inactivity_timeout")?,
        })
    }
}

/// Where a file transfer reads from.
#[derive(Debug)]
pub enum FileSource {
    Path(PathBuf),
    /// An already-open file; it is closed once the transfer ends.
    Descriptor(std::fs::File),
}

/// Send a window of a file to the client.
#[derive(Debug)]
pub struct SendFile {
    pub source: FileSource,
    pub offset: u64,
    /// Defaults to the rest of the file after `offset`.
    pub length: Option<u64>,
    /// Sent before the file contents.
    pub reply: Option<Payload>,
}

impl SendFile {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new(FileSource::Path(path.into()))
    }

    pub fn new(source: FileSource) -> Self {
        Self {
            source,
            offset: 0,
            length: None,
            reply: None,
        }
    }

    pub fn with_window(mut self, offset: u64, length: Option<u64>) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<Payload>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, CommandError> {
        let source = match map.get("file") {
            Some(Value::String(path)) => FileSource::Path(PathBuf::from(path)),
            _ => {
                // Raw descriptors only travel through the typed API.
                return Err(CommandError::field("file", "expected a path"));
            }
        };

        let offset = optional_u64(&map, "offset")?.unwrap_or(0);
        let length = optional_u64(&map, "nbytes")?;
        let reply = optional_payload(&map, "reply")?;

        Ok(Self {
            source,
            offset,
            length,
            reply,
        })
    }
}

/// Certificate checking for the backend TLS upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRequirement {
    /// Accept any server certificate.
    #[default]
    #[serde(alias = "CERT_NONE")]
    None,
    /// Verify against `ca_certs` (same as `Required` for a client).
    #[serde(alias = "CERT_OPTIONAL")]
    Optional,
    /// Verify against `ca_certs`.
    #[serde(alias = "CERT_REQUIRED")]
    Required,
}

/// TLS parameters for the backend upgrade (`ssl_args`).
///
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// SNI name; defaults to the remote host.
    #[serde(alias = "server_name")]
    pub server_hostname: Option<String>,
    /// PEM bundle of trusted roots.
    pub ca_certs: Option<PathBuf>,
    /// PEM client certificate chain.
    pub certfile: Option<PathBuf>,
    /// PEM client key; read from `certfile` when absent.
    pub keyfile: Option<PathBuf>,
    pub cert_reqs: CertRequirement,
}

fn remote_from_pair(pair: &[Value]) -> Result<RemoteAddr, CommandError> {
    match pair {
        [Value::String(host), Value::Number(port)] => {
            let port = port
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| CommandError::field("remote", format!("bad port {}", port)))?;
            Ok(RemoteAddr::new(host.as_str(), port))
        }
        _ => Err(CommandError::field("remote", "expected [host, port]")),
    }
}

fn bytes_from_value(key: &'static str, value: &Value) -> Result<Bytes, CommandError> {
    match payload_from_value(key, value)? {
        Payload::Bytes(bytes) => Ok(bytes),
        Payload::Chunks(chunks) => Ok(Bytes::from(chunks.concat())),
        Payload::Stream(_) => Err(CommandError::field(key, "expected bytes")),
    }
}

fn payload_from_value(key: &'static str, value: &Value) -> Result<Payload, CommandError> {
    match value {
        Value::String(text) => Ok(Payload::Bytes(Bytes::from(text.clone()))),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => Ok(Bytes::from(text.clone())),
                _ => Err(CommandError::field(key, "chunks must be strings")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Chunks),
        _ => Err(CommandError::field(key, "expected a string or a list of strings")),
    }
}

fn optional_payload(map: &Map<String, Value>, key: &'static str) -> Result<Option<Payload>, CommandError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => payload_from_value(key, value).map(Some),
    }
}

fn optional_u64(map: &Map<String, Value>, key: &'static str) -> Result<Option<u64>, CommandError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| CommandError::field(key, "expected a non-negative integer")),
    }
}

fn duration_from_map(map: &Map<String, Value>, key: &'static str) -> Result<Option<Duration>, CommandError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let secs = value
                .as_f64()
                .ok_or_else(|| CommandError::field(key, "expected seconds"))?;
            Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|e| CommandError::field(key, e.to_string()))
        }
    }
}
