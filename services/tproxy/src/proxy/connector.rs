//! Backend connection establishment.
//!
//! Opens a TCP socket of the right family for the remote, optionally
//! upgrades it to TLS, and bounds the whole sequence by the command's
//! connect deadline. Every failure comes back as a [`ConnectionError`].
//! When the deadline fires the in-flight future is dropped, which closes
//! the half-open socket with it.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tproxy_networking::RemoteAddr;
use tracing::debug;

use super::command::{CertRequirement, Forward, TlsOptions};
use super::transfer::{send_data, Payload};
use crate::error::{ConnectFailure, ConnectionError};

/// Size of the single read performed after flushing the buffer to the backend.
pub const BACKEND_READ_SIZE: usize = 1024;

/// Plain or TLS backend socket.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BackendStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, BackendStream::Tls(_))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BackendStream::Plain(stream) => stream.peer_addr(),
            BackendStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An established backend connection, ready to be handed to a relay.
pub struct BackendConnection {
    pub stream: BackendStream,
    pub remote: RemoteAddr,
    /// Inactivity bound for whoever relays this connection.
    pub inactivity_timeout: Option<Duration>,
    pub extra: Option<Value>,
}

impl BackendConnection {
    /// Send the pending chunks, then read one chunk of the answer.
    ///
    /// The returned chunk is empty if the backend closed without answering.
    pub async fn exchange_once(&mut self, pending: Vec<Bytes>) -> io::Result<Bytes> {
        send_data(&mut self.stream, Payload::Chunks(pending)).await?;

        let mut buf = vec![0u8; BACKEND_READ_SIZE];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Connect to the backend named by a forward command.
pub async fn connect(forward: &Forward) -> Result<BackendConnection, ConnectionError> {
    let remote = &forward.remote;
    let attempt = open(remote, forward.tls, &forward.tls_options);

    let stream = match forward.connect_timeout {
        Some(limit) => timeout(limit, attempt)
            .await
            .map_err(|_| ConnectionError::new(remote, ConnectFailure::Timeout(limit)))?,
        None => attempt.await,
    }
    .map_err(|failure| ConnectionError::new(remote, failure))?;

    Ok(BackendConnection {
        stream,
        remote: remote.clone(),
        inactivity_timeout: forward.inactivity_timeout,
        extra: forward.extra.clone(),
    })
}

async fn open(
    remote: &RemoteAddr,
    tls: bool,
    options: &TlsOptions,
) -> Result<BackendStream, ConnectFailure> {
    let addr = resolve(remote).await?;

    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };

    debug!(remote = %remote, addr = %addr, tls, "Connecting to backend");
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;

    if !tls {
        return Ok(BackendStream::Plain(stream));
    }

    let config = client_config(options)?;
    let name = options
        .server_hostname
        .clone()
        .unwrap_or_else(|| remote.host.clone());
    let server_name = ServerName::try_from(name)
        .map_err(|e| ConnectFailure::Tls(format!("invalid server name: {}", e)))?;

    let tls_stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;

    Ok(BackendStream::Tls(Box::new(tls_stream)))
}

async fn resolve(remote: &RemoteAddr) -> io::Result<SocketAddr> {
    if let Some(addr) = remote.socket_addr() {
        return Ok(addr);
    }

    lookup_host((remote.host.as_str(), remote.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", remote.host),
            )
        })
}

fn client_config(options: &TlsOptions) -> Result<ClientConfig, ConnectFailure> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(tls_failure)?;

    let builder = match options.cert_reqs {
        CertRequirement::None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider })),
        CertRequirement::Optional | CertRequirement::Required => {
            let Some(ca_certs) = &options.ca_certs else {
                return Err(ConnectFailure::Tls(
                    "certificate verification requires ca_certs".to_string(),
                ));
            };
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_certs)? {
                roots.add(cert).map_err(tls_failure)?;
            }
            builder.with_root_certificates(roots)
        }
    };

    let config = match &options.certfile {
        Some(certfile) => {
            let certs = load_certs(certfile)?;
            let key = load_key(options.keyfile.as_deref().unwrap_or(certfile))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(tls_failure)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(config)
}

fn tls_failure(err: rustls::Error) -> ConnectFailure {
    ConnectFailure::Tls(err.to_string())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConnectFailure> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(ConnectFailure::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConnectFailure> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        ConnectFailure::Tls(format!("no private key found in {}", path.display()))
    })
}

/// Verifier used when `cert_reqs` is `none`.
///
/// The chain is not checked, but handshake signatures still are.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
