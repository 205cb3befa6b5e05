//! Termexec Daemon
//!
//! HTTP service for remote shell execution.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::{Config, ExecServer};
use tracing_subscriber::EnvFilter;

/// Termexec Daemon - remote shell execution over HTTP.
#[derive(Parser, Debug)]
#[command(name = "termexec-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the exec server
    Start {
        /// Port to listen on (0 picks a free port)
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(long, short)]
        bind: Option<IpAddr>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Commands::Start { port, bind } = &cli.command {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(bind) = bind {
            config.server.bind_addr = bind.to_string();
        }
    }

    init_tracing(&config, cli.verbose);

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Start { .. } => run_server(config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Initialize tracing. `RUST_LOG` wins over `--verbose`, which wins over the
/// configured level.
fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the server until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Termexec daemon starting...");

    let server = ExecServer::bind(&config)
        .await
        .context("Failed to start exec server")?;
    tracing::info!("Listening on http://{}", server.local_addr());

    server
        .serve(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!("Failed to listen for shutdown signals: {}", e);
            }
            tracing::info!("Received shutdown signal");
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
