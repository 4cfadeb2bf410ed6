use crate::cache::{Cache, CacheEvents};
use crate::config::KnotConfig;
use crate::console;
use crate::ident::{LinkType, Locator, LocatorHash};
use crate::resolve::ResolutionGraph;
use crate::{KnotError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Produces the archive for a locator when the cache misses. The
/// returned path is a temporary file the cache takes ownership of.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn supports_locator(&self, locator: &Locator) -> bool;

    async fn fetch(&self, locator: &Locator, config: &KnotConfig) -> Result<PathBuf>;
}

pub struct FetchOptions {
    pub config: Arc<KnotConfig>,
    pub cache: Arc<Cache>,
    /// Checksums recorded by a previous install, keyed by locator.
    pub expected_checksums: BTreeMap<LocatorHash, String>,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    /// Verified checksums for every hard-linked package, to be written
    /// back to the lockfile.
    pub checksums: BTreeMap<LocatorHash, String>,
    pub hits: usize,
    pub misses: usize,
}

/// Fetches every accessible hard package in the graph into the cache,
/// at most `fetch_concurrency` downloads in flight. Virtual packages
/// share the archive of their physical counterpart; soft packages
/// (workspaces) have no archive at all.
pub async fn fetch_everything(
    graph: &ResolutionGraph,
    fetcher: Arc<dyn Fetcher>,
    options: &FetchOptions,
) -> Result<FetchSummary> {
    let mut seen = BTreeSet::new();
    let mut targets = Vec::new();

    for hash in graph.accessible.iter() {
        let package = graph.package_of(hash)?;

        if package.link_type == LinkType::Soft {
            continue;
        }

        let physical = package.locator.devirtualize();
        if !seen.insert(physical.hash().clone()) {
            continue;
        }

        if !fetcher.supports_locator(&physical) {
            return Err(KnotError::NoResolverFound {
                request: physical.to_string(),
            });
        }

        targets.push(physical);
    }

    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let misses = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let events = {
        let hits = hits.clone();
        let misses = misses.clone();
        CacheEvents {
            on_hit: Some(Box::new(move |_| {
                hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })),
            on_miss: Some(Box::new(move |locator| {
                misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                console::verbose(&format!("fetching {locator}"));
            })),
        }
    };

    let concurrency = options.config.fetch_concurrency.max(1);

    let results = stream::iter(targets.into_iter().map(|locator| {
        let fetcher = fetcher.clone();
        let cache = options.cache.clone();
        let config = options.config.clone();
        let expected = options
            .expected_checksums
            .get(locator.hash())
            .cloned();
        let events = &events;

        async move {
            let fetched = cache
                .fetch(&locator, expected.as_deref(), events, || async {
                    fetcher.fetch(&locator, &config).await
                })
                .await?;

            let mut fetched = fetched;
            fetched.view.release();

            Ok::<_, KnotError>((locator.hash().clone(), fetched.checksum))
        }
    }))
    .buffer_unordered(concurrency)
    .collect::<Vec<_>>()
    .await;

    let mut summary = FetchSummary::default();

    for result in results {
        let (hash, checksum) = result?;
        if let Some(checksum) = checksum {
            summary.checksums.insert(hash, checksum);
        }
    }

    summary.hits = hits.load(std::sync::atomic::Ordering::Relaxed);
    summary.misses = misses.load(std::sync::atomic::Ordering::Relaxed);

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{Descriptor, Ident, Package};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        dir: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        fn supports_locator(&self, _locator: &Locator) -> bool {
            true
        }

        async fn fetch(&self, locator: &Locator, _config: &KnotConfig) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let path = self.dir.join(format!("{}.tgz", locator.slug()));
            let file = File::create(&path).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let data = locator.to_string().into_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "package/index.js", data.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();

            Ok(path)
        }
    }

    fn test_options(dir: &Path) -> FetchOptions {
        let mut config = KnotConfig::from_env();
        config.cache_dir = dir.join("cache");
        config.mirror_dir = None;
        config.immutable_cache = false;
        config.check_cache = false;
        config.fetch_concurrency = 4;

        let cache = Cache::new(&config);

        FetchOptions {
            config: Arc::new(config),
            cache: Arc::new(cache),
            expected_checksums: BTreeMap::new(),
        }
    }

    fn graph_with(packages: Vec<Package>) -> ResolutionGraph {
        let mut graph = ResolutionGraph::new();
        for package in packages {
            graph.accessible.insert(package.hash().clone());
            graph.packages.insert(package.hash().clone(), package);
        }
        graph
    }

    fn hard_package(name: &str) -> Package {
        Package::new(Locator::new(Ident::new(None, name), "npm:1.0.0"))
    }

    #[tokio::test]
    async fn fetches_hard_packages_and_records_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());

        let left = hard_package("left");
        let right = hard_package("right");
        let graph = graph_with(vec![left.clone(), right.clone()]);

        let fetcher = Arc::new(StaticFetcher {
            dir: dir.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });

        let summary = fetch_everything(&graph, fetcher.clone(), &options)
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.misses, 2);
        assert!(summary.checksums.contains_key(left.hash()));
        assert!(summary.checksums.contains_key(right.hash()));
    }

    #[tokio::test]
    async fn soft_packages_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());

        let mut workspace = Package::new(Locator::new(
            Ident::new(None, "app"),
            "workspace:packages/app",
        ));
        workspace.link_type = LinkType::Soft;

        let graph = graph_with(vec![workspace]);

        let fetcher = Arc::new(StaticFetcher {
            dir: dir.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });

        let summary = fetch_everything(&graph, fetcher.clone(), &options)
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(summary.checksums.is_empty());
    }

    #[tokio::test]
    async fn virtual_packages_share_their_physical_archive() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());

        let physical = hard_package("pkg");
        let entropy = "abcd1234";
        let virtual_package = physical.virtualize(entropy);

        let mut graph = graph_with(vec![physical.clone(), virtual_package]);
        // Register a descriptor for graph consistency.
        let descriptor = Descriptor::new(Ident::new(None, "pkg"), "npm:^1.0.0");
        graph
            .descriptors
            .insert(descriptor.hash().clone(), descriptor);

        let fetcher = Arc::new(StaticFetcher {
            dir: dir.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });

        let summary = fetch_everything(&graph, fetcher.clone(), &options)
            .await
            .unwrap();

        // One archive serves both the physical package and its clone.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.checksums.len(), 1);
        assert!(summary.checksums.contains_key(physical.hash()));
    }

    #[tokio::test]
    async fn second_run_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());

        let graph = graph_with(vec![hard_package("pkg")]);

        let fetcher = Arc::new(StaticFetcher {
            dir: dir.path().to_path_buf(),
            calls: AtomicUsize::new(0),
        });

        fetch_everything(&graph, fetcher.clone(), &options)
            .await
            .unwrap();
        let summary = fetch_everything(&graph, fetcher.clone(), &options)
            .await
            .unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.misses, 0);
    }
}
