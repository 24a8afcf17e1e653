//! Relay Daemon
//!
//! Hosts streaming response sessions on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Default socket ($XDG_RUNTIME_DIR/relay/relay.sock), Ollama pipeline
//! relay-daemon
//!
//! # Scripted demo pipeline, no Ollama needed
//! relay-daemon --demo --socket /tmp/relay.sock
//!
//! # With verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Protocol
//!
//! ```bash
//! printf '{"content":"hello","session_id":"s1"}\n' | nc -U -q 60 /tmp/relay.sock
//! ```
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: cancel in-flight sessions, stop accepting, remove socket

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use relay_core::{default_config_path, load_config_from_path, ConfigOverrides, PipelineKind, StreamManager};
use relay_daemon::{build_pipeline, DaemonServer, ServerConfig};

/// Streaming response session daemon
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about)]
struct Args {
    /// Unix socket path
    #[arg(long, env = "RELAY_SOCKET")]
    socket: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/relay/relay.toml)
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Serve the scripted demo pipeline instead of Ollama
    #[arg(long)]
    demo: bool,

    /// Session timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(path) = &self.socket {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(secs) = self.timeout_secs {
            overrides = overrides.with_timeout_secs(secs);
        }
        if let Some(max) = self.max_sessions {
            overrides = overrides.with_max_sessions(max);
        }
        if self.demo {
            overrides = overrides.with_pipeline(PipelineKind::Demo);
        }
        overrides
    }
}

/// Resolves once SIGINT or SIGTERM arrives
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_daemon=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!("Starting Relay Daemon");
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    let overrides = args.overrides();
    if !overrides.is_empty() {
        overrides
            .apply(&mut config)
            .context("Invalid command-line override")?;
    }
    info!(
        source = %config.source(),
        pipeline = ?config.pipeline,
        socket = ?config.socket_path,
        timeout_secs = config.session_timeout.as_secs(),
        max_sessions = config.max_concurrent_sessions,
        "Configuration loaded"
    );

    let pipeline = build_pipeline(&config)?;
    if !pipeline.health_check().await {
        warn!(
            pipeline = pipeline.name(),
            "Pipeline is not reachable yet; sessions will fail until it is"
        );
    }

    let manager = Arc::new(StreamManager::new(pipeline, config.manager_config()));
    let server = DaemonServer::new(
        config.socket_path.clone(),
        manager,
        ServerConfig::from_relay_config(&config),
    );

    let shutdown = Arc::new(Notify::new());
    let notify = Arc::clone(&shutdown);
    tokio::spawn(async move {
        shutdown_signal().await;
        notify.notify_one();
    });

    info!("Ready to accept connections");
    server
        .run(shutdown.notified())
        .await
        .context("Daemon server failed")?;

    info!("Relay daemon stopped cleanly");
    Ok(())
}
