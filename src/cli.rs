//! CLI argument definitions and command entrypoints.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::core::config::{Config, SAMPLE_CONFIG};
use crate::net::Server;
use crate::telemetry;

/// Framewire - reliable binary RPC over WebSocket.
#[derive(Parser)]
#[command(name = "framewire")]
#[command(version)]
#[command(about = "Framewire RPC server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a server
    Start(StartArgs),

    /// Write a starter configuration file
    Init(InitArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/framewire.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct InitArgs {
    /// Destination for the generated configuration
    #[arg(long, default_value = "config/framewire.toml")]
    pub path: PathBuf,
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    let from_file = args.config.exists();
    let config = if from_file {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    if from_file {
        info!("loaded configuration from {}", args.config.display());
    } else {
        info!(
            "config {} not found, using built-in defaults",
            args.config.display()
        );
    }
    let server = Server::new(config);
    server.run().await
}

pub fn run_init(args: InitArgs) -> Result<()> {
    if args.path.exists() {
        bail!("refusing to overwrite existing {}", args.path.display());
    }
    if let Some(parent) = args.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&args.path, SAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", args.path.display()))?;
    println!("wrote {}", args.path.display());
    Ok(())
}
