//! site2docs CLI: turn archived HTML snapshots into clustered Markdown docs.
//!
//! Renders every snapshot in a headless browser, groups pages by their
//! link structure, and writes one document per cluster plus a manifest.

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
