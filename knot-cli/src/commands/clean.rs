use anyhow::Result;
use clap::Args;
use knot_core::{console, KnotConfig, Project};
use std::env;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct CleanArgs {}

pub async fn run(_args: CleanArgs, config: KnotConfig) -> Result<()> {
    let cwd = env::current_dir()?;
    let project = Project::open(&cwd, Arc::new(config))?;

    let removed = project.clean_cache().await?;

    console::info(&format!("removed {} stale cache entries", removed.len()));
    for path in removed.iter() {
        console::verbose(&format!("removed {}", path.display()));
    }

    Ok(())
}
