//! Learnline CLI: learning-moment recommendations from the terminal.
//!
//! Routes a question into a query line, tracks what the user has shown they
//! understand, and recommends content shaped by the current learning moment.

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
