//! TCP listener and connection dispatch.
//!
//! One [`Listener`] per listen address. Every accepted connection runs the
//! session pipeline on its own task; failures are logged and never affect
//! other connections or the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::session::{run_session, SessionConfig};
use crate::error::SessionError;

/// Pause after an accept error before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Per-connection settings.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration with default session settings.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            session: SessionConfig::default(),
        }
    }
}

/// A bound TCP listener for the relay.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Port reported by the bound socket (resolves port 0).
    listen_port: u16,
    /// Session settings shared by all connections.
    session: Arc<SessionConfig>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            upstream_port = %config.session.port_policy,
            "Listener bound"
        );

        Ok(Self {
            listener,
            listen_port: local_addr.port(),
            session: Arc::new(config.session),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let session = Arc::clone(&self.session);
                    let listen_port = self.listen_port;

                    tokio::spawn(
                        handle_connection(stream, peer_addr, listen_port, session).instrument(
                            tracing::info_span!("connection", peer = %peer_addr, port = listen_port),
                        ),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Handle a single connection.
async fn handle_connection(
    client: TcpStream,
    peer_addr: SocketAddr,
    listen_port: u16,
    session: Arc<SessionConfig>,
) {
    debug!(peer_addr = %peer_addr, "Handling connection");
    let _ = client.set_nodelay(true);

    match run_session(client, listen_port, &session).await {
        Ok(outcome) => {
            debug!(
                protocol = %outcome.protocol,
                host = %outcome.host,
                backend_port = outcome.backend_port,
                bytes_to_backend = outcome.stats.bytes_to_backend,
                bytes_from_backend = outcome.stats.bytes_from_backend,
                "Connection closed"
            );
        }
        Err(e @ SessionError::Sniff(_)) => {
            warn!(reason = e.reason_code(), error = %e, "Couldn't classify connection");
        }
        Err(e @ SessionError::Extract(_)) => {
            warn!(reason = e.reason_code(), error = %e, "Couldn't extract hostname");
        }
        Err(e @ SessionError::Dial(_)) => {
            warn!(reason = e.reason_code(), error = %e, "Backend unreachable");
        }
    }
}
