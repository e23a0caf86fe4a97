//! Per-connection pipeline: sniff, extract, dial, relay.
//!
//! Each step strictly follows the previous one. Any failure before the relay
//! starts drops the client stream, which closes the connection without ever
//! dialing a backend past the failing step.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::http::read_http_host;
use super::peek::DEFAULT_MAX_PEEK_BYTES;
use super::relay::{connect_backend, proxy_bidirectional, RelayStats, DEFAULT_CONNECT_TIMEOUT};
use super::sni::read_client_hello;
use super::sniff::{sniff, Protocol, DEFAULT_SNIFF_TIMEOUT};
use crate::error::{ConfigError, ExtractError, SessionError};

/// How the backend port is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortPolicy {
    /// The port the client connected to.
    #[default]
    SameAsListener,
    /// 443 for TLS, 80 for plaintext HTTP.
    ProtocolDefault,
    /// Always this port.
    Fixed(u16),
}

impl PortPolicy {
    /// Backend port for a connection accepted on `listen_port`.
    pub fn resolve(self, listen_port: u16, protocol: Protocol) -> u16 {
        match self {
            PortPolicy::SameAsListener => listen_port,
            PortPolicy::ProtocolDefault => protocol.default_port(),
            PortPolicy::Fixed(port) => port,
        }
    }
}

impl FromStr for PortPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "same" => Ok(PortPolicy::SameAsListener),
            "default" => Ok(PortPolicy::ProtocolDefault),
            other => match other.parse::<u16>() {
                Ok(port) if port != 0 => Ok(PortPolicy::Fixed(port)),
                _ => Err(ConfigError::InvalidPortPolicy(s.to_string())),
            },
        }
    }
}

impl fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortPolicy::SameAsListener => f.write_str("same"),
            PortPolicy::ProtocolDefault => f.write_str("default"),
            PortPolicy::Fixed(port) => write!(f, "{port}"),
        }
    }
}

/// Settings shared by every session of a listener.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for the first byte to arrive.
    pub sniff_timeout: Duration,
    /// Time allowed for the backend connect.
    pub connect_timeout: Duration,
    /// Upper bound on bytes read while looking for the hostname.
    pub max_peek_bytes: usize,
    /// Backend port selection.
    pub port_policy: PortPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_peek_bytes: DEFAULT_MAX_PEEK_BYTES,
            port_policy: PortPolicy::default(),
        }
    }
}

/// What a completed session did.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub protocol: Protocol,
    pub host: String,
    pub backend_port: u16,
    pub stats: RelayStats,
}

/// Handle one client connection accepted on `listen_port`.
///
/// Returns once both relay directions have finished.
pub async fn run_session<S>(
    client: S,
    listen_port: u16,
    config: &SessionConfig,
) -> Result<SessionOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sniffed, client) = sniff(client, config.sniff_timeout).await;
    let protocol = sniffed?;
    debug!(protocol = %protocol, "Connection classified");

    let (host, client) = match protocol {
        Protocol::Tls => {
            let (hello, client) = read_client_hello(client, config.max_peek_bytes).await?;
            let host = hello
                .server_name
                .ok_or(ExtractError::NoHostname("ClientHello"))?;
            (host, client)
        }
        Protocol::Http => read_http_host(client, config.max_peek_bytes).await?,
    };

    let backend_port = config.port_policy.resolve(listen_port, protocol);
    debug!(host = %host, backend_port = backend_port, "Got new request");

    let backend = connect_backend(&host, backend_port, config.connect_timeout).await?;
    let stats = proxy_bidirectional(client, backend).await;

    Ok(SessionOutcome {
        protocol,
        host,
        backend_port,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DialError, SniffError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fixed(port: u16) -> SessionConfig {
        SessionConfig {
            port_policy: PortPolicy::Fixed(port),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_port_policy_resolve() {
        assert_eq!(PortPolicy::SameAsListener.resolve(8443, Protocol::Tls), 8443);
        assert_eq!(PortPolicy::ProtocolDefault.resolve(8443, Protocol::Tls), 443);
        assert_eq!(PortPolicy::ProtocolDefault.resolve(8080, Protocol::Http), 80);
        assert_eq!(PortPolicy::Fixed(9000).resolve(8080, Protocol::Http), 9000);
    }

    #[test]
    fn test_port_policy_parse() {
        assert_eq!("same".parse::<PortPolicy>().unwrap(), PortPolicy::SameAsListener);
        assert_eq!("default".parse::<PortPolicy>().unwrap(), PortPolicy::ProtocolDefault);
        assert_eq!("8443".parse::<PortPolicy>().unwrap(), PortPolicy::Fixed(8443));
        assert!("0".parse::<PortPolicy>().is_err());
        assert!("443x".parse::<PortPolicy>().is_err());
        assert_eq!(PortPolicy::Fixed(81).to_string(), "81");
    }

    #[tokio::test]
    async fn test_http_session_relays_request() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = fixed(backend.local_addr().unwrap().port());

        let (client, mut client_peer) = tokio::io::duplex(4096);
        let request = b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n";
        client_peer.write_all(request).await.unwrap();

        let session = tokio::spawn(async move { run_session(client, 8080, &config).await });

        let (mut upstream, _) = backend.accept().await.unwrap();
        let mut got = vec![0u8; request.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, request);

        upstream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(upstream);
        client_peer.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_peer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");

        let outcome = session.await.unwrap().unwrap();
        assert_eq!(outcome.protocol, Protocol::Http);
        assert_eq!(outcome.host, "127.0.0.1");
        assert_eq!(outcome.stats.bytes_to_backend, request.len() as u64);
    }

    #[tokio::test]
    async fn test_bad_request_is_never_dialed() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = fixed(backend.local_addr().unwrap().port());

        let (client, mut client_peer) = tokio::io::duplex(4096);
        client_peer.write_all(b"\x01\x02garbage\r\n\r\n").await.unwrap();

        let err = run_session(client, 8080, &config).await.unwrap_err();
        assert!(matches!(err, SessionError::Extract(ExtractError::Http(_))), "{err:?}");

        // The client side sees the connection close.
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let accepted =
            tokio::time::timeout(Duration::from_millis(100), backend.accept()).await;
        assert!(accepted.is_err(), "backend must not be dialed");
    }

    #[tokio::test]
    async fn test_empty_connection() {
        let (client, client_peer) = tokio::io::duplex(64);
        drop(client_peer);
        let err = run_session(client, 8080, &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Sniff(SniffError::NoData)), "{err:?}");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = fixed(dead.local_addr().unwrap().port());
        drop(dead);

        let (client, mut client_peer) = tokio::io::duplex(4096);
        client_peer
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();

        let err = run_session(client, 8080, &config).await.unwrap_err();
        assert!(matches!(err, SessionError::Dial(DialError::Connect { .. })), "{err:?}");

        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no bytes may be relayed");
    }
}
