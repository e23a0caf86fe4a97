pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Cli, Config, ListenProtocol, ListenSpec, LogFormat, LogLevel};
pub use error::{ConfigError, DialError, ExtractError, SessionError, SniffError};
pub use proxy::{
    ClientHelloInfo, Listener, ListenerConfig, PeekStream, PortPolicy, Protocol, RelayStats,
    Replay, SessionConfig, SessionOutcome,
};
