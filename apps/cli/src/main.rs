//! coursesmith CLI: guided course generation, one control signal per run.
//!
//! Each invocation loads the latest (or a chosen) run from the local run
//! database, applies one pipeline action and saves the run again.

mod commands;
mod render;

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
