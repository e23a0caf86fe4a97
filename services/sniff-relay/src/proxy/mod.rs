//! Protocol-sniffing TCP relay.
//!
//! This module provides:
//! - Non-destructive stream inspection with replay
//! - First-byte TLS / HTTP classification
//! - Hostname extraction from TLS ClientHello (SNI) or HTTP `Host`
//! - Backend dialing and half-close aware bidirectional relay
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Sniffer -> SNI / Host extractor -> Dial -> Relay -> Backend
//!                          \______ peeked bytes replayed ______/
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sniff_relay::proxy::{Listener, ListenerConfig};
//!
//! let config = ListenerConfig::new("0.0.0.0:443".parse()?);
//! let listener = Arc::new(Listener::bind(config).await?);
//! listener.run().await?;
//! ```

mod http;
mod listener;
mod peek;
mod relay;
mod session;
mod sni;
mod sniff;

pub use http::read_http_host;
pub use listener::{Listener, ListenerConfig};
pub use peek::{PeekStream, Replay, DEFAULT_MAX_PEEK_BYTES};
pub use relay::{connect_backend, proxy_bidirectional, RelayStats, DEFAULT_CONNECT_TIMEOUT};
pub use session::{run_session, PortPolicy, SessionConfig, SessionOutcome};
pub use sni::{read_client_hello, ClientHelloInfo};
pub use sniff::{sniff, Protocol, DEFAULT_SNIFF_TIMEOUT};
