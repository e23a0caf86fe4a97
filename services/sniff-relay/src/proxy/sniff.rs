//! First-byte protocol classification.
//!
//! A TLS connection always opens with a handshake record, whose content type
//! byte is 0x16. Anything else is treated as plaintext HTTP.

use std::fmt;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::time::timeout;

use super::peek::{PeekStream, Replay};
use crate::error::SniffError;

/// Default time to wait for the first byte.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Application protocol spoken by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TLS; the hostname comes from SNI.
    Tls,
    /// Plaintext HTTP/1.x; the hostname comes from the Host header.
    Http,
}

impl Protocol {
    /// Classify a connection by its first byte.
    pub fn from_first_byte(byte: u8) -> Self {
        if byte == TLS_HANDSHAKE_RECORD {
            Protocol::Tls
        } else {
            Protocol::Http
        }
    }

    /// Well-known port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Tls => 443,
            Protocol::Http => 80,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tls => "https",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read one byte within `window` and classify the connection.
///
/// The stream is handed back in every case with whatever was read still
/// unconsumed.
pub async fn sniff<S: AsyncRead + Unpin>(
    stream: S,
    window: Duration,
) -> (Result<Protocol, SniffError>, Replay<S>) {
    let mut peek = PeekStream::new(stream);
    let mut first = [0u8; 1];

    let result = match timeout(window, peek.peek_read(&mut first)).await {
        Ok(Ok(0)) => Err(SniffError::NoData),
        Ok(Ok(_)) => Ok(Protocol::from_first_byte(first[0])),
        Ok(Err(e)) => Err(SniffError::Io(e)),
        Err(_) => Err(SniffError::Timeout),
    };

    (result, peek.into_replay())
}
