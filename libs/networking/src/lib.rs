//! Address helpers for the proxy.
//!
//! This library provides helpers for:
//! - Parsing `host:port` style address literals (IPv4, bracketed IPv6, hostnames)
//! - Detecting IPv6 literals so callers can pick the socket family

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Default port used when an address literal carries none.
pub const DEFAULT_PORT: u16 = 5000;

/// Host used for an empty address literal.
pub const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid address literal.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Port is not a number in range.
    #[error("{0:?} is not a valid port number")]
    InvalidPort(String),
}

// ============================================================================
// Address literals
// ============================================================================

/// A remote endpoint as written by the user: a host (IP literal or name) and a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    /// Lowercased host, without IPv6 brackets.
    pub host: String,

    /// TCP port.
    pub port: u16,
}

impl RemoteAddr {
    /// Create a new remote address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
        }
    }

    /// Parse the host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        IpAddr::from_str(&self.host).ok()
    }

    /// Socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Whether the host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        is_ipv6(&self.host)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for RemoteAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s, DEFAULT_PORT)
    }
}

/// Check whether `host` is an IPv6 address literal.
///
/// Brackets are tolerated so `[::1]` is recognised as well.
pub fn is_ipv6(host: &str) -> bool {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ipv6Addr::from_str(host).is_ok()
}

/// Parse an address literal into host and port.
///
/// Accepted forms:
/// - `host:port`, `1.2.3.4:port`
/// - `[v6]:port` and `[v6]`
/// - a bare IPv6 literal (`::1`), a bare host, or the empty string (`0.0.0.0`)
///
/// Missing ports fall back to `default_port`.
pub fn parse_address(netloc: &str, default_port: u16) -> Result<RemoteAddr, NetworkError> {
    let netloc = netloc.trim();

    if netloc.is_empty() {
        return Ok(RemoteAddr::new(UNSPECIFIED_HOST, default_port));
    }

    // Unbracketed IPv6 literals have no room for a port.
    if is_ipv6(netloc) && !netloc.starts_with('[') {
        return Ok(RemoteAddr::new(netloc, default_port));
    }

    let (host, rest) = if let Some(bracketed) = netloc.strip_prefix('[') {
        let Some((host, rest)) = bracketed.split_once(']') else {
            return Err(NetworkError::InvalidAddress(netloc.to_string()));
        };
        if !is_ipv6(host) {
            return Err(NetworkError::InvalidAddress(netloc.to_string()));
        }
        (host, rest)
    } else {
        match netloc.find(':') {
            Some(idx) => netloc.split_at(idx),
            None => (netloc, ""),
        }
    };

    let port = match rest.strip_prefix(':') {
        Some(port) => parse_port(port)?,
        None if rest.is_empty() => default_port,
        None => return Err(NetworkError::InvalidAddress(netloc.to_string())),
    };

    let host = if host.is_empty() { UNSPECIFIED_HOST } else { host };

    Ok(RemoteAddr::new(host, port))
}

fn parse_port(port: &str) -> Result<u16, NetworkError> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NetworkError::InvalidPort(port.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| NetworkError::InvalidPort(port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let addr = parse_address("Example.COM:8080", DEFAULT_PORT).unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 8080);
        assert!(!addr.is_ipv6());
        assert!(addr.ip().is_none());
    }

    #[test]
    fn test_parse_ipv4() {
        let addr = parse_address("1.2.3.4:80", DEFAULT_PORT).unwrap();
        assert_eq!(addr.socket_addr(), Some("1.2.3.4:80".parse().unwrap()));
        assert_eq!(addr.to_string(), "1.2.3.4:80");
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let addr = parse_address("[FD00::1]:443", DEFAULT_PORT).unwrap();
        assert_eq!(addr.host, "fd00::1");
        assert_eq!(addr.port, 443);
        assert!(addr.is_ipv6());
        assert_eq!(addr.to_string(), "[fd00::1]:443");

        let no_port = parse_address("[::1]", 9000).unwrap();
        assert_eq!(no_port.port, 9000);
    }

    #[test]
    fn test_parse_bare_forms() {
        assert_eq!(
            parse_address("::1", 7000).unwrap(),
            RemoteAddr::new("::1", 7000)
        );
        assert_eq!(
            parse_address("localhost", 7000).unwrap(),
            RemoteAddr::new("localhost", 7000)
        );
        assert_eq!(
            parse_address("", 7000).unwrap(),
            RemoteAddr::new(UNSPECIFIED_HOST, 7000)
        );
        assert_eq!(
            parse_address(":8000", 7000).unwrap(),
            RemoteAddr::new(UNSPECIFIED_HOST, 8000)
        );
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        assert_eq!(
            parse_address("host:http", DEFAULT_PORT),
            Err(NetworkError::InvalidPort("http".to_string()))
        );
        assert!(parse_address("host:70000", DEFAULT_PORT).is_err());
        assert!(parse_address("host:", DEFAULT_PORT).is_err());
        assert!(parse_address("[::1]x", DEFAULT_PORT).is_err());
        assert!(parse_address("[nothost]:80", DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_is_ipv6() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("[2001:db8::1]"));
        assert!(!is_ipv6("127.0.0.1"));
        assert!(!is_ipv6("example.com"));
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let remote = RemoteAddr::from(addr);
        assert_eq!(remote.to_string(), "[::1]:8080");
    }
}
