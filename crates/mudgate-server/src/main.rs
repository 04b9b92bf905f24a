//! mudgate-server: game-to-WebSocket bridge.
//!
//! Accepts WebSocket connections from thin front ends, maintains telnet
//! sessions to the game server, and streams classified output blocks with
//! replay-based reconnect catch-up.

mod config;
mod directory;
mod gateway;
mod replaceable;
mod tabulate;
mod telnet;

use clap::Parser;
use config::ServerConfig;
use directory::ConnectionDirectory;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// mudgate-server — game session bridge
#[derive(Parser, Debug)]
#[command(name = "mudgate-server", version, about = "Game session bridge")]
struct Cli {
    /// Gateway bind address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.mudgate/config.toml")]
    config: String,

    /// Game server host
    #[arg(long)]
    game_host: Option<String>,

    /// Game server port
    #[arg(long)]
    game_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mudgate-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.game_host.as_deref(),
        cli.game_port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        gateway = %server_config.bind,
        game = %format!("{}:{}", server_config.game.host, server_config.game.port),
        "configuration loaded"
    );

    let directory = match ConnectionDirectory::new(server_config.clone()) {
        Ok(dir) => Arc::new(dir),
        Err(e) => {
            error!(error = %e, "failed to build connection directory");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = gateway::run(&server_config.bind, directory) => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("mudgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
