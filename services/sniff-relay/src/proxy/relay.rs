//! Backend dialing and bidirectional byte relay.
//!
//! Each direction copies until its source reaches EOF or fails, then shuts
//! down the write side of its destination. The other direction keeps running
//! until its own source is exhausted, so half-closed connections drain
//! correctly.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::DialError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Byte counts for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client -> backend (including the replayed prefix).
    pub bytes_to_backend: u64,
    /// Bytes copied backend -> client.
    pub bytes_from_backend: u64,
}

/// Resolve `host` and connect to it on `port`.
pub async fn connect_backend(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, DialError> {
    if host.is_empty() {
        return Err(DialError::EmptyHost);
    }

    debug!(host = %host, port = port, "Connecting to backend");

    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            // Best effort; relayed traffic is often interactive.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Connect {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            host: host.to_string(),
            port,
        }),
    }
}

/// Relay data between `client` and `backend` until both directions finish.
///
/// I/O errors end the affected direction only and are not returned.
pub async fn proxy_bidirectional<C, B>(client: C, backend: B) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (to_backend, from_backend) = tokio::join!(
        copy_then_shutdown(&mut client_read, &mut backend_write, "client->backend"),
        copy_then_shutdown(&mut backend_read, &mut client_write, "backend->client"),
    );

    RelayStats {
        bytes_to_backend: to_backend,
        bytes_from_backend: from_backend,
    }
}

/// Copy `reader` into `writer`, then shut down `writer`.
///
/// Returns the number of bytes written before the direction ended.
async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let result: io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;

    if let Err(e) = result {
        debug!(direction, error = %e, bytes = total, "Relay direction ended with error");
    }

    if let Err(e) = writer.shutdown().await {
        debug!(direction, error = %e, "Shutdown failed");
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_half_close_is_independent() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (backend, mut backend_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(proxy_bidirectional(client, backend));

        // Client sends a request and closes its write side.
        client_peer.write_all(b"request").await.unwrap();
        client_peer.shutdown().await.unwrap();

        // The backend sees the request followed by EOF...
        let mut got = Vec::new();
        backend_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        // ...and can still answer afterwards.
        backend_peer.write_all(b"response").await.unwrap();
        backend_peer.shutdown().await.unwrap();

        let mut got = Vec::new();
        client_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response");

        let stats = relay.await.unwrap();
        assert_eq!(
            stats,
            RelayStats {
                bytes_to_backend: 7,
                bytes_from_backend: 8,
            }
        );
    }

    #[tokio::test]
    async fn test_replayed_prefix_reaches_backend_once() {
        use crate::proxy::peek::PeekStream;

        let (client, mut client_peer) = tokio::io::duplex(1024);
        client_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut peek = PeekStream::new(client);
        let mut buf = [0u8; 4];
        peek.peek_read(&mut buf).await.unwrap();

        let (backend, mut backend_peer) = tokio::io::duplex(1024);
        let relay = tokio::spawn(proxy_bidirectional(peek.into_replay(), backend));

        client_peer.write_all(b"body").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut got = Vec::new();
        backend_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.1\r\n\r\nbody");

        drop(backend_peer);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_backend("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_empty_host_is_not_dialed() {
        let err = connect_backend("", 80, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::EmptyHost));
    }

    #[tokio::test]
    async fn test_connect_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_backend("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }
}
