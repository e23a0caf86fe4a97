//! Error types for the relay.
//!
//! Startup problems are [`ConfigError`] and end the process. Everything else
//! is scoped to a single client connection and only ever ends that
//! connection.

use std::io;

use thiserror::Error;

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unsupported listen protocol.
    #[error("invalid protocol {0:?} (only \"tcp\" is supported)")]
    InvalidProtocol(String),

    /// A port entry is not a valid port number.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// A range entry is malformed or reversed.
    #[error("invalid port range {0:?}")]
    InvalidPortRange(String),

    /// The port specification expanded to nothing.
    #[error("no ports to listen on")]
    NoPorts,

    /// Unknown log level.
    #[error("invalid log level {0:?} (expected debug, info, warn or error)")]
    InvalidLogLevel(String),

    /// Unknown log format.
    #[error("invalid log format {0:?} (expected text or json)")]
    InvalidLogFormat(String),

    /// Unknown upstream port policy.
    #[error("invalid upstream port {0:?} (expected same, default or a port number)")]
    InvalidPortPolicy(String),
}

/// Failure to classify the first byte of a connection.
#[derive(Debug, Error)]
pub enum SniffError {
    /// The client closed before sending anything.
    #[error("no data read from the connection")]
    NoData,

    /// Nothing arrived within the sniff window.
    #[error("timed out waiting for the first byte")]
    Timeout,

    /// Read failure.
    #[error("error reading from connection: {0}")]
    Io(#[source] io::Error),
}

/// Failure to extract a destination hostname.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The handshake state machine rejected the input before a full
    /// ClientHello was parsed.
    #[error("tls handshake rejected: {0}")]
    Tls(#[from] rustls::Error),

    /// The request head is not valid HTTP/1.x.
    #[error("malformed http request: {0}")]
    Http(#[from] httparse::Error),

    /// The peer closed before the handshake or request head was complete.
    #[error("stream ended after {read} bytes, before the message was complete")]
    Truncated { read: usize },

    /// The handshake or request head exceeds the peek limit.
    #[error("message exceeds peek limit of {limit} bytes")]
    TooLarge { limit: usize },

    /// The message was parsed but names no host.
    #[error("no hostname in {0}")]
    NoHostname(&'static str),

    /// Read failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to reach the backend.
#[derive(Debug, Error)]
pub enum DialError {
    /// Nothing to dial.
    #[error("empty backend hostname")]
    EmptyHost,

    /// The connect did not finish in time.
    #[error("connect to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },

    /// Resolution or connect failure.
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Any error that ends a client session before relaying starts.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sniff(#[from] SniffError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Dial(#[from] DialError),
}

impl SessionError {
    /// Short reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Sniff(SniffError::NoData) => "sniff_no_data",
            SessionError::Sniff(SniffError::Timeout) => "sniff_timeout",
            SessionError::Sniff(SniffError::Io(_)) => "sniff_io",
            SessionError::Extract(ExtractError::Tls(_)) => "tls_malformed",
            SessionError::Extract(ExtractError::Http(_)) => "http_malformed",
            SessionError::Extract(ExtractError::Truncated { .. }) => "truncated",
            SessionError::Extract(ExtractError::TooLarge { .. }) => "too_large",
            SessionError::Extract(ExtractError::NoHostname(_)) => "no_hostname",
            SessionError::Extract(ExtractError::Io(_)) => "extract_io",
            SessionError::Dial(DialError::EmptyHost) => "empty_host",
            SessionError::Dial(DialError::Timeout { .. }) => "dial_timeout",
            SessionError::Dial(DialError::Connect { .. }) => "dial_failed",
        }
    }
}
