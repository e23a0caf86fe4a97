//! Relay configuration.
//!
//! Flags (each with an environment fallback) are parsed once at startup into
//! an immutable [`Config`] that is handed to listeners.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::proxy::{PortPolicy, SessionConfig, DEFAULT_MAX_PEEK_BYTES};

/// Command line interface.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sniff-relay",
    version,
    about = "Transparent TCP relay that forwards by TLS SNI or HTTP Host"
)]
pub struct Cli {
    /// Ports to listen on, separated by ',' (80,443,1080); ranges like
    /// 8080-8090 and combinations of both are accepted.
    #[arg(long, env = "SNIFF_RELAY_PORT", default_value = "8080")]
    pub port: String,

    /// Listen protocols, separated by ','. Only 'tcp' is supported.
    #[arg(long, env = "SNIFF_RELAY_PROTOCOL", default_value = "tcp")]
    pub protocol: String,

    /// Host to listen on.
    #[arg(long, env = "SNIFF_RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Logging level: debug, info, warn or error. RUST_LOG takes precedence.
    #[arg(long, env = "SNIFF_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: text or json.
    #[arg(long, env = "SNIFF_RELAY_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Backend port: 'same' as the listener, 'default' (443 for TLS, 80 for
    /// HTTP) or a fixed port number.
    #[arg(long, env = "SNIFF_RELAY_UPSTREAM_PORT", default_value = "same")]
    pub upstream_port: String,

    /// Time to wait for the first client byte, in milliseconds.
    #[arg(long, env = "SNIFF_RELAY_SNIFF_TIMEOUT_MS", default_value_t = 5000)]
    pub sniff_timeout_ms: u64,

    /// Backend connect timeout, in milliseconds.
    #[arg(long, env = "SNIFF_RELAY_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Maximum bytes read while looking for the hostname.
    #[arg(long, env = "SNIFF_RELAY_MAX_PEEK_BYTES", default_value_t = DEFAULT_MAX_PEEK_BYTES)]
    pub max_peek_bytes: usize,
}

/// Transport a listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenProtocol {
    Tcp,
}

impl FromStr for ListenProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ListenProtocol::Tcp),
            other => Err(ConfigError::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ListenProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenProtocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// One listener to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub protocol: ListenProtocol,
    pub host: String,
    pub port: u16,
}

impl ListenSpec {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address())
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
    }
}

/// Validated relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listeners to start, one per protocol and port.
    pub listeners: Vec<ListenSpec>,

    /// Log level used when RUST_LOG is not set.
    pub log_level: LogLevel,

    /// Log output format.
    pub log_format: LogFormat,

    /// Per-connection settings.
    pub session: SessionConfig,
}

impl Config {
    /// Validate parsed flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let log_level = cli.log_level.parse::<LogLevel>()?;
        let log_format = cli.log_format.parse::<LogFormat>()?;
        let protocols = parse_protocols(&cli.protocol)?;
        let ports = parse_ports(&cli.port)?;
        let port_policy = cli.upstream_port.parse::<PortPolicy>()?;

        let listeners = protocols
            .iter()
            .flat_map(|protocol| {
                ports.iter().map(move |port| ListenSpec {
                    protocol: *protocol,
                    host: cli.host.clone(),
                    port: *port,
                })
            })
            .collect();

        Ok(Self {
            listeners,
            log_level,
            log_format,
            session: SessionConfig {
                sniff_timeout: Duration::from_millis(cli.sniff_timeout_ms),
                connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
                max_peek_bytes: cli.max_peek_bytes,
                port_policy,
            },
        })
    }
}

/// Split a comma separated list, dropping empty entries.
fn split_list(input: &str) -> impl Iterator<Item = &str> {
    input.split(',').map(str::trim).filter(|e| !e.is_empty())
}

/// Parse a protocol list such as `tcp`.
pub fn parse_protocols(input: &str) -> Result<Vec<ListenProtocol>, ConfigError> {
    let mut protocols = Vec::new();
    for entry in split_list(input) {
        let protocol = entry.parse::<ListenProtocol>()?;
        if !protocols.contains(&protocol) {
            protocols.push(protocol);
        }
    }

    if protocols.is_empty() {
        return Err(ConfigError::InvalidProtocol(input.to_string()));
    }
    Ok(protocols)
}

/// Expand a port specification such as `80,443,8080-8090`.
///
/// Ranges are inclusive. Duplicates are dropped, keeping first-seen order.
pub fn parse_ports(input: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |port: u16| {
        if seen.insert(port) {
            ports.push(port);
        }
    };

    for entry in split_list(input) {
        if let Some((start, end)) = entry.split_once('-') {
            let invalid = || ConfigError::InvalidPortRange(entry.to_string());
            let start = parse_port(start.trim()).ok_or_else(invalid)?;
            let end = parse_port(end.trim()).ok_or_else(invalid)?;
            if start > end {
                return Err(invalid());
            }
            (start..=end).for_each(&mut push);
        } else {
            let port = parse_port(entry).ok_or_else(|| ConfigError::InvalidPort(entry.to_string()))?;
            push(port);
        }
    }

    if ports.is_empty() {
        return Err(ConfigError::NoPorts);
    }
    Ok(ports)
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|port| *port != 0)
}
