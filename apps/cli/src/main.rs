//! loadctl CLI — control-plane metadata for incremental ETL pipelines.
//!
//! Registers sources, advances watermarks, and records pipeline runs on
//! behalf of an external orchestrator and its extract/load workers.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
