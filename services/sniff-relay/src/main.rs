//! sniff-relay
//!
//! Transparent protocol-sniffing TCP relay.
//!
//! This service:
//! - Listens on every configured port
//! - Classifies each connection as TLS or plaintext HTTP from its first byte
//! - Extracts the destination from the TLS ClientHello (SNI) or `Host` header
//! - Connects to that host and relays bytes both ways, untouched

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniff_relay::{Cli, Config, ListenSpec, Listener, ListenerConfig, LogFormat, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sniff-relay");
    info!(
        listener_count = config.listeners.len(),
        upstream_port = %config.session.port_policy,
        sniff_timeout_ms = config.session.sniff_timeout.as_millis() as u64,
        connect_timeout_ms = config.session.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let mut listeners = JoinSet::new();
    for spec in &config.listeners {
        match bind_listener(spec, &config.session).await {
            Ok(listener) => {
                let listener = Arc::new(listener);
                listeners.spawn(async move {
                    if let Err(e) = listener.run().await {
                        error!(error = %e, "Listener error");
                    }
                });
            }
            Err(e) => {
                error!(listen = %spec, error = %format!("{e:#}"), "Error listening");
            }
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("none of the {} listeners could be bound", config.listeners.len());
    }

    tokio::select! {
        _ = async { while listeners.join_next().await.is_some() {} } => {
            warn!("All listeners stopped");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Initialize tracing (prefer RUST_LOG, fallback to --log-level).
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().compact()))
        .init();
}

async fn bind_listener(spec: &ListenSpec, session: &SessionConfig) -> Result<Listener> {
    let bind_addr = tokio::net::lookup_host(spec.address())
        .await
        .with_context(|| format!("failed to resolve {}", spec.address()))?
        .next()
        .with_context(|| format!("{} resolved to no addresses", spec.address()))?;

    let listener = Listener::bind(ListenerConfig {
        bind_addr,
        session: session.clone(),
    })
    .await
    .with_context(|| format!("failed to bind {bind_addr}"))?;

    Ok(listener)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
