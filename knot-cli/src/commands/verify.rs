use anyhow::{bail, Result};
use clap::Args;
use knot_core::fetcher::{fetch_everything, FetchOptions};
use knot_core::registry::HttpFetcher;
use knot_core::state::InstallState;
use knot_core::{console, Cache, KnotConfig};
use std::env;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct VerifyArgs {}

/// Re-walks the cached archive of every installed package with the
/// checksum policy forced to fail on any mismatch.
pub async fn run(_args: VerifyArgs, mut config: KnotConfig) -> Result<()> {
    config.check_cache = true;
    config.skip_integrity_check = false;

    let cwd = env::current_dir()?;
    let state_path = config.install_state_path(&cwd);

    let Some(snapshot) = InstallState::load(&state_path)? else {
        bail!("no install state found; run `knot install` first");
    };

    let config = Arc::new(config);
    let cache = Arc::new(Cache::new(&config));

    let options = FetchOptions {
        config: config.clone(),
        cache,
        expected_checksums: snapshot.checksums.clone(),
    };

    let summary = fetch_everything(&snapshot.graph, Arc::new(HttpFetcher::new()), &options).await?;

    console::info(&format!(
        "verified {} archives against the lockfile",
        summary.checksums.len()
    ));

    Ok(())
}
