//! # kas
//!
//! Reverse-tunnel control plane for in-cluster agents.
//!
//! ## Subcommands
//!
//! - `kas serve --config <file>`: run the server
//! - `kas agent --config <file>`: run the agent-side tunnel pool
//!
//! Exit code is `0` after a clean shutdown and `1` when configuration or
//! startup fails.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kas::app;
use kas::Config;

/// Reverse-tunnel control plane for in-cluster agents.
#[derive(Parser)]
#[command(name = "kas", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the agent: keep tunnels open to kas and serve requests from them.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { config } => serve(config.as_deref()).await,
        Commands::Agent { config } => agent(config.as_deref()).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let msg = format!("{e:#}");
            error!(error = %msg, "Exiting");
            eprintln!("kas: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn load(config_path: Option<&str>) -> anyhow::Result<Config> {
    let config = Config::load(config_path).context("loading configuration")?;
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
    Ok(config)
}

async fn serve(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    info!("kas v{} starting", env!("CARGO_PKG_VERSION"));
    app::run(config).await.context("running server")
}

async fn agent(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    info!("kas agent v{} starting", env!("CARGO_PKG_VERSION"));
    let ctx = CancellationToken::new();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = app::wait_for_signal().await {
            error!(error = %e, "Failed to listen for signals");
        }
        signal_ctx.cancel();
    });
    app::agentk::run_agent(&config, ctx)
        .await
        .context("running agent")
}
