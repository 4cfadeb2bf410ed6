use anyhow::Result;
use clap::Args;
use knot_core::project::InstallOptions;
use knot_core::{console, KnotConfig, Project};
use std::env;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Fail instead of changing the lockfile
    #[arg(long = "frozen-lockfile", alias = "immutable")]
    pub frozen_lockfile: bool,
    /// Resolve, fetch and link, but skip install scripts
    #[arg(long = "skip-builds")]
    pub skip_builds: bool,
}

pub async fn run(args: InstallArgs, config: KnotConfig) -> Result<()> {
    let cwd = env::current_dir()?;
    let project = Project::open(&cwd, Arc::new(config))?;

    let options = InstallOptions {
        frozen_lockfile: args.frozen_lockfile,
        skip_builds: args.skip_builds,
    };

    let report = project.install(&options).await?;

    if report.from_snapshot {
        tracing::info!("resolution unchanged, reused install state");
    }

    for warning in report.peer_warnings.iter() {
        tracing::warn!("{warning}");
    }

    console::info(&format!(
        "{} packages ({} cache hits, {} downloads), {} built, {} skipped",
        report.packages,
        report.cache_hits,
        report.cache_misses,
        report.builds.built.len(),
        report.builds.skipped.len(),
    ));

    Ok(())
}
