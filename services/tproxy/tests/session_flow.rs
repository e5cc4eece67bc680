
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use harness::{dead_addr, roundtrip, OneShotBackend, ProxyHandle, RecordingRoute, TlsBackend};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tproxy::proxy::{Command, JsonRoute, SendFile, StaticRoute};
use tproxy::{CommandError, ErrorKind, RemoteAddr};

fn ping_route(buffered: &[u8]) -> Result<Command, CommandError> {
    Ok(match buffered {
        b"PING" => Command::reply_and_close("PONG"),
        _ => Command::NoOp,
    })
}

#[tokio::test]
async fn ping_is_answered_and_closed() {
    let proxy = ProxyHandle::spawn(Arc::new(ping_route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"PING").await.unwrap();
    assert_eq!(response, b"PONG");

    proxy.wait_closed(1).await;
    assert_eq!(proxy.tracker.active(), 0);
    assert_eq!(proxy.tracker.status(), "tproxy-test [0 active connections]");
    proxy.stop().await;
}

#[tokio::test]
async fn static_route_flushes_request_to_backend() {
    let backend = OneShotBackend::spawn(b"HTTP/1.0 200 OK\r\n\r\nhello").await.unwrap();
    let route = StaticRoute::new(RemoteAddr::from(backend.addr))
        .with_connect_timeout(Some(Duration::from_secs(1)));
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nhello");
    assert_eq!(backend.requests(), vec![b"GET / HTTP/1.0\r\n\r\n".to_vec()]);

    proxy.wait_closed(1).await;
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(proxy.listener.stats().forwarded.load(Ordering::Relaxed), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn json_route_rewrites_data_over_tls() {
    let backend = TlsBackend::spawn("localhost", "tls-backend").await.unwrap();
    let remote = backend.addr.to_string();

    let route = JsonRoute::new(move |buffered: &[u8]| {
        if !buffered.ends_with(b"\n") {
            return Value::Null;
        }
        json!({
            "remote": remote,
            "data": "REWRITTEN\n",
            "ssl": true,
            "ssl_args": {"server_hostname": "localhost"},
            "connect_timeout": 1,
        })
    })
    .flush_on_connect(true);
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"client request\n").await.unwrap();

    assert_eq!(response, b"tls-backend");
    assert_eq!(backend.requests(), vec![b"REWRITTEN\n".to_vec()]);
    proxy.stop().await;
}

#[tokio::test]
async fn tls_verification_against_ca_bundle() {
    let backend = TlsBackend::spawn("localhost", "verified").await.unwrap();
    let mut ca = tempfile::NamedTempFile::new().unwrap();
    ca.write_all(backend.cert_pem.as_bytes()).unwrap();

    let remote = backend.addr.to_string();
    let ca_path = ca.path().to_string_lossy().to_string();
    let route = JsonRoute::new(move |_: &[u8]| {
        json!({
            "remote": remote,
            "ssl": true,
            "ssl_args": {
                "server_hostname": "localhost",
                "ca_certs": ca_path,
                "cert_reqs": "required",
            },
        })
    })
    .flush_on_connect(true);
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"hello").await.unwrap();
    assert_eq!(response, b"verified");
    proxy.stop().await;
}

#[tokio::test]
async fn tls_verification_failure_is_connection_error() {
    let backend = TlsBackend::spawn("localhost", "unreachable").await.unwrap();
    let other = TlsBackend::spawn("localhost", "other").await.unwrap();
    let mut ca = tempfile::NamedTempFile::new().unwrap();
    ca.write_all(other.cert_pem.as_bytes()).unwrap();

    let remote = backend.addr.to_string();
    let ca_path = ca.path().to_string_lossy().to_string();
    let route = RecordingRoute::new(JsonRoute::new(move |_: &[u8]| {
        json!({
            "remote": remote,
            "ssl": true,
            "ssl_args": {"ca_certs": ca_path, "cert_reqs": "required", "server_hostname": "localhost"},
        })
    }));
    let errors = Arc::clone(&route.errors);
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"hello").await.unwrap();
    assert!(response.is_empty());

    proxy.wait_closed(1).await;
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::Connection]);
    proxy.stop().await;
}

#[tokio::test]
async fn connect_failure_reports_and_closes_client() {
    let dead = dead_addr().await;
    let route = RecordingRoute::new(StaticRoute::new(RemoteAddr::from(dead)));
    let errors = Arc::clone(&route.errors);
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    assert!(response.is_empty());

    proxy.wait_closed(1).await;
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::Connection]);
    assert_eq!(proxy.listener.stats().connection_errors.load(Ordering::Relaxed), 1);
    assert_eq!(proxy.tracker.active(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn send_file_window_over_tcp() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0123456789abcdefghij").unwrap();
    let path = file.path().to_path_buf();

    let route = move |_: &[u8]| -> Result<Command, CommandError> {
        Ok(Command::SendFile(
            SendFile::path(path.clone())
                .with_window(10, Some(5))
                .with_reply("HTTP/1.0 200 OK\r\n\r\n"),
        ))
    };
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"GET /x.bin HTTP/1.0\r\n\r\n").await.unwrap();
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nabcde");
    proxy.stop().await;
}

#[tokio::test]
async fn send_large_file_over_tcp() {
    let content: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&content).unwrap();
    let path = file.path().to_path_buf();

    let route = move |_: &[u8]| -> Result<Command, CommandError> {
        Ok(Command::SendFile(SendFile::path(path.clone())))
    };
    let proxy = ProxyHandle::spawn(Arc::new(route)).await.unwrap();

    let response = roundtrip(proxy.listen_addr, b"go").await.unwrap();
    assert_eq!(response.len(), content.len());
    assert!(response == content);
    proxy.stop().await;
}

#[tokio::test]
async fn idle_client_hits_inactivity_timeout() {
    let route = RecordingRoute::new(ping_route);
    let errors = Arc::clone(&route.errors);
    let proxy = ProxyHandle::spawn_with(Arc::new(route), |config| {
        config.inactivity_timeout = Some(Duration::from_millis(100));
    })
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    proxy.wait_closed(1).await;
    assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::InactivityTimeout]);
    assert_eq!(
        proxy.listener.stats().inactivity_timeouts.load(Ordering::Relaxed),
        1
    );
    proxy.stop().await;
}

#[tokio::test]
async fn concurrent_sessions_leave_counter_at_zero() {
    let proxy = ProxyHandle::spawn(Arc::new(ping_route)).await.unwrap();

    let clients: Vec<_> = (0..16)
        .map(|_| tokio::spawn(roundtrip(proxy.listen_addr, b"PING")))
        .collect();
    for client in clients {
        assert_eq!(client.await.unwrap().unwrap(), b"PONG");
    }

    proxy.wait_closed(16).await;
    assert_eq!(proxy.tracker.active(), 0);
    assert_eq!(
        proxy.listener.stats().connections_accepted.load(Ordering::Relaxed),
        16
    );
    proxy.stop().await;
}

#[tokio::test]
async fn connections_beyond_limit_are_rejected() {
    let proxy = ProxyHandle::spawn_with(Arc::new(ping_route), |config| {
        config.max_connections = 1;
    })
    .await
    .unwrap();

    // Holds the only permit without ever completing a command.
    let _idle = TcpStream::connect(proxy.listen_addr).await.unwrap();
    while proxy.tracker.active() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = roundtrip(proxy.listen_addr, b"PING").await;
    assert!(response.map(|r| r.is_empty()).unwrap_or(true));
    assert_eq!(
        proxy.listener.stats().connections_rejected.load(Ordering::Relaxed),
        1
    );
    proxy.stop().await;
}

#[tokio::test]
async fn shutdown_cancels_open_sessions() {
    let proxy = ProxyHandle::spawn(Arc::new(ping_route)).await.unwrap();

    let mut idle = TcpStream::connect(proxy.listen_addr).await.unwrap();
    while proxy.tracker.active() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let listener = Arc::clone(&proxy.listener);
    let tracker = proxy.tracker.clone();
    proxy.stop().await;

    assert_eq!(tracker.active(), 0);
    assert_eq!(listener.stats().cancelled.load(Ordering::Relaxed), 1);

    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(5), idle.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}
