use anyhow::Result;
use clap::Parser;
use knot_core::KnotConfig;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let args = Cli::parse();

    if args.verbose {
        // The core library reads this flag for its own progress output.
        unsafe { std::env::set_var("KNOT_VERBOSE", "1") };
    }

    let config = KnotConfig::from_env();

    match args.command {
        Command::Install(install) => commands::install::run(install, config).await,
        Command::Verify(verify) => commands::verify::run(verify, config).await,
        Command::Clean(clean) => commands::clean::run(clean, config).await,
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
