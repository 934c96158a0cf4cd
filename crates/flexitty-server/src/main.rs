//! flexitty: multiplayer terminal server.
//!
//! Runs a shell on a pseudo-terminal and shares it with every WebSocket
//! client attached to the session. Output fans out to all clients; input
//! from any client goes to the terminal.

use clap::Parser;
use flexitty_server::config::{CliOverrides, ServerConfig};
use flexitty_server::server::FlexiServer;
use std::path::PathBuf;
use tracing::{error, info};

/// flexitty: WebSocket-based multiplayer TTY
#[derive(Parser, Debug)]
#[command(name = "flexitty", version, about = "WebSocket-based multiplayer TTY")]
struct Cli {
    /// Address to listen on
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.flexitty/config.toml")]
    config: String,

    /// History buffer size per session, in bytes
    #[arg(long)]
    buffer_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run in each new session, followed by its arguments
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting flexitty");

    let mut command = cli.command.into_iter();
    let overrides = CliOverrides {
        address: cli.listen,
        port: cli.port,
        command: command.next(),
        args: command.collect(),
        buffer_capacity: cli.buffer_capacity,
    };

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = FlexiServer::new(server_config).run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("flexitty stopped");
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
