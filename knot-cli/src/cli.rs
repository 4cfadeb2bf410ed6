use crate::commands;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "knot",
    about = "deterministic package resolution and fetching",
    version,
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve, fetch, link and build the project's dependencies
    Install(commands::install::InstallArgs),
    /// Re-verify every cached archive against the lockfile checksums
    Verify(commands::verify::VerifyArgs),
    /// Remove cache entries the current install no longer uses
    Clean(commands::clean::CleanArgs),
}
