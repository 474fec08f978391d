//! memforge CLI: turn uploaded text files into smart and fine-tune datasets.
//!
//! Mirrors the upload and download surface: `process` runs a batch through
//! both stages and prints the download links, `download` and `preview` read
//! artifacts back out of the scratch store.

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
