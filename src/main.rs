//! Framewire - unified CLI entrypoint.
//!
//! Usage:
//!   framewire start --config config/framewire.toml
//!   framewire init --path config/framewire.toml

use anyhow::Result;
use clap::Parser;
use framewire::cli::{run_init, run_start, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Init(args) => run_init(args),
    }
}
