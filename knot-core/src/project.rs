use crate::cache::Cache;
use crate::config::KnotConfig;
use crate::console;
use crate::fetcher::{fetch_everything, FetchOptions};
use crate::ident::{Descriptor, DependencyMeta, Ident, Locator, LocatorHash, PeerDependencyMeta};
use crate::lifecycle::{build_everything, BuildReport};
use crate::linker::{link_everything, LinkContext, StoreLinker};
use crate::lockfile;
use crate::registry::{HttpFetcher, RegistryResolver};
use crate::resolve::peers::apply_virtual_resolutions;
use crate::resolve::{resolve_everything, ResolutionGraph, ResolveOptions};
use crate::resolver::{
    import_legacy_lockfile, LockfileResolver, ProtocolResolver, ResolveContext, Resolver,
    ResolverChain, StoredState, WorkspaceHandle, WorkspaceResolver,
};
use crate::state::{fingerprint, InstallState};
use crate::{KnotError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_NAME: &str = "package.json";
pub const LEGACY_LOCKFILE_NAME: &str = "package-lock.json";

/// The slice of `package.json` the install pipeline consumes.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "dependenciesMeta")]
    pub dependencies_meta: BTreeMap<String, DependencyMeta>,
    #[serde(default, rename = "peerDependenciesMeta")]
    pub peer_dependencies_meta: BTreeMap<String, PeerDependencyMeta>,
    #[serde(default)]
    pub workspaces: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(KnotError::ManifestMissing {
                path: path.to_path_buf(),
            });
        }

        let data = fs::read_to_string(path).map_err(|source| KnotError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&data).map_err(|source| KnotError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })
    }
}

/// One locally-developed package: the project root counts as a
/// workspace too.
#[derive(Clone, Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub relative_path: String,
    pub manifest: Manifest,
}

impl Workspace {
    fn ident(&self) -> Result<Ident> {
        match self.manifest.name.as_deref() {
            Some(name) => Ident::parse(name),
            // The project root is allowed to be anonymous.
            None if self.relative_path == "." => Ok(Ident::new(None, "root")),
            None => Err(KnotError::ManifestInvalid {
                path: self.root.join(MANIFEST_NAME),
                reason: "workspace manifests must declare a name".to_string(),
            }),
        }
    }

    fn handle(&self) -> Result<WorkspaceHandle> {
        let mut handle = WorkspaceHandle::new(
            self.ident()?,
            self.manifest.version.clone(),
            &self.relative_path,
        );

        let requests = self
            .manifest
            .dependencies
            .iter()
            .chain(self.manifest.dev_dependencies.iter())
            .chain(self.manifest.optional_dependencies.iter());

        for (name, range) in requests {
            let descriptor = Descriptor::new(Ident::parse(name)?, range);
            handle
                .dependencies
                .insert(descriptor.ident().hash().clone(), descriptor);
        }

        for (name, range) in self.manifest.peer_dependencies.iter() {
            let descriptor = Descriptor::new(Ident::parse(name)?, range);
            handle
                .peer_dependencies
                .insert(descriptor.ident().hash().clone(), descriptor);
        }

        Ok(handle)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InstallOptions {
    /// Refuse to change the lockfile; fail instead.
    pub frozen_lockfile: bool,
    pub skip_builds: bool,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub packages: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub peer_warnings: Vec<String>,
    pub builds: BuildReport,
    /// Resolution was skipped because the install state still matched
    /// the lockfile.
    pub from_snapshot: bool,
}

#[derive(Debug)]
pub struct Project {
    pub root: PathBuf,
    pub config: Arc<KnotConfig>,
    pub workspaces: Vec<Workspace>,
}

impl Project {
    /// Opens the project at `root`: loads the root manifest, expands
    /// its workspace patterns, and checks that no two workspaces share
    /// a name.
    pub fn open(root: &Path, config: Arc<KnotConfig>) -> Result<Self> {
        let manifest = Manifest::load(&root.join(MANIFEST_NAME))?;

        let mut workspaces = vec![Workspace {
            root: root.to_path_buf(),
            relative_path: ".".to_string(),
            manifest: manifest.clone(),
        }];

        for pattern in manifest.workspaces.iter() {
            for dir in expand_workspace_pattern(root, pattern)? {
                let manifest_path = dir.join(MANIFEST_NAME);
                if !manifest_path.is_file() {
                    console::warn(&format!(
                        "workspace directory {} has no manifest, skipping",
                        dir.display()
                    ));
                    continue;
                }

                let relative = dir
                    .strip_prefix(root)
                    .unwrap_or(&dir)
                    .to_string_lossy()
                    .replace('\\', "/");

                workspaces.push(Workspace {
                    root: dir.clone(),
                    relative_path: relative,
                    manifest: Manifest::load(&manifest_path)?,
                });
            }
        }

        let project = Project {
            root: root.to_path_buf(),
            config,
            workspaces,
        };

        let mut seen = BTreeSet::new();
        for workspace in project.workspaces.iter() {
            let ident = workspace.ident()?;
            if !seen.insert(ident.hash().clone()) {
                return Err(KnotError::DuplicateWorkspace {
                    ident: ident.to_string(),
                });
            }
        }

        Ok(project)
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(self.config.lockfile_name())
    }

    fn workspace_handles(&self) -> Result<Vec<WorkspaceHandle>> {
        self.workspaces
            .iter()
            .map(|workspace| workspace.handle())
            .collect()
    }

    fn resolver_chain() -> ResolverChain {
        let registry: Arc<dyn Resolver> = Arc::new(RegistryResolver::new());

        ResolverChain::new(vec![
            Arc::new(LockfileResolver),
            Arc::new(WorkspaceResolver),
            Arc::new(ProtocolResolver::new(registry.clone())),
            registry,
        ])
    }

    /// Reads prior state: the lockfile if present, otherwise a one-time
    /// import of a previous-format lockfile left by another tool.
    fn stored_state(&self) -> Result<StoredState> {
        let stored = lockfile::read(&self.lockfile_path())?;

        if stored.resolutions.is_empty() {
            let legacy = self.root.join(LEGACY_LOCKFILE_NAME);
            if legacy.is_file() {
                console::info("importing resolutions from a previous-format lockfile");
                return import_legacy_lockfile(&legacy);
            }
        }

        Ok(stored)
    }

    async fn resolve_graph(
        &self,
        handles: &[WorkspaceHandle],
        stored: StoredState,
    ) -> Result<(ResolutionGraph, Vec<String>)> {
        let context = ResolveContext::new(self.config.clone())
            .with_stored(stored)
            .with_workspaces(handles.to_vec());

        let chain = Self::resolver_chain();

        let roots: Vec<Descriptor> = handles
            .iter()
            .map(|handle| handle.anchored_descriptor())
            .collect();

        let mut graph =
            resolve_everything(&roots, &chain, &context, &ResolveOptions::default()).await?;

        let root_locators: Vec<Locator> = handles
            .iter()
            .map(|handle| handle.anchored_locator().clone())
            .collect();

        let report = apply_virtual_resolutions(&mut graph, &root_locators)?;

        let warnings: Vec<String> = report
            .warnings
            .iter()
            .map(|warning| warning.to_string())
            .collect();
        for warning in warnings.iter() {
            console::warn(warning);
        }

        Ok((graph, warnings))
    }

    fn write_lockfile(
        &self,
        graph: &ResolutionGraph,
        checksums: &BTreeMap<LocatorHash, String>,
        excluded: &BTreeSet<LocatorHash>,
        frozen: bool,
    ) -> Result<Vec<u8>> {
        let path = self.lockfile_path();

        if frozen {
            let staging = tempfile::NamedTempFile::new().map_err(|source| {
                KnotError::WriteFile {
                    path: path.clone(),
                    source,
                }
            })?;

            lockfile::write(staging.path(), graph, checksums, excluded)?;

            let fresh = fs::read(staging.path()).map_err(|source| KnotError::ReadFile {
                path: staging.path().to_path_buf(),
                source,
            })?;
            let existing = fs::read(&path).unwrap_or_default();

            if fresh != existing {
                return Err(KnotError::ManifestInvalid {
                    path,
                    reason: "lockfile would change but it is frozen".to_string(),
                });
            }

            return Ok(fresh);
        }

        lockfile::write(&path, graph, checksums, excluded)?;
        fs::read(&path).map_err(|source| KnotError::ReadFile {
            path,
            source,
        })
    }

    /// The whole pipeline: resolve, virtualize, persist, fetch, link,
    /// build, snapshot. Reuses the previous run's graph when the
    /// lockfile is byte-identical to what that run wrote.
    pub async fn install(&self, options: &InstallOptions) -> Result<InstallReport> {
        let mut report = InstallReport::default();

        let handles = self.workspace_handles()?;
        let excluded: BTreeSet<LocatorHash> = handles
            .iter()
            .map(|handle| handle.anchored_locator().hash().clone())
            .collect();

        let lockfile_data = fs::read(&self.lockfile_path()).unwrap_or_default();
        let snapshot = InstallState::load(&self.config.install_state_path(&self.root))?;

        let (graph, checksums, lockfile_bytes) = match snapshot {
            Some(snapshot) if !lockfile_data.is_empty() && snapshot.matches(&lockfile_data) => {
                report.from_snapshot = true;
                (snapshot.graph, snapshot.checksums, lockfile_data)
            }
            _ => {
                let stored = self.stored_state()?;
                let stored_checksums = stored.checksums.clone();

                let (graph, warnings) = self.resolve_graph(&handles, stored).await?;
                report.peer_warnings = warnings;

                let bytes =
                    self.write_lockfile(&graph, &stored_checksums, &excluded, options.frozen_lockfile)?;
                (graph, stored_checksums, bytes)
            }
        };

        report.packages = graph.packages.len();

        let cache = Arc::new(Cache::new(&self.config));
        let fetch_options = FetchOptions {
            config: self.config.clone(),
            cache: cache.clone(),
            expected_checksums: checksums.clone(),
        };

        let summary =
            fetch_everything(&graph, Arc::new(HttpFetcher::new()), &fetch_options).await?;
        report.cache_hits = summary.hits;
        report.cache_misses = summary.misses;

        // Fetching can learn checksums the lockfile did not have yet.
        let mut checksums = checksums;
        let mut checksums_changed = false;
        for (hash, checksum) in summary.checksums {
            if checksums.get(&hash) != Some(&checksum) {
                checksums.insert(hash, checksum);
                checksums_changed = true;
            }
        }

        let lockfile_bytes = if checksums_changed && !report.from_snapshot {
            self.write_lockfile(&graph, &checksums, &excluded, options.frozen_lockfile)?
        } else {
            lockfile_bytes
        };

        let link_context = LinkContext {
            project_root: self.root.clone(),
            config: self.config.clone(),
        };

        let mut linker = StoreLinker::new();
        let builds =
            link_everything(&graph, &mut linker, &cache, &checksums, &link_context).await?;

        if !options.skip_builds {
            report.builds = build_everything(
                &graph,
                builds,
                &self.config,
                &self.config.build_state_path(&self.root),
            )?;
        }

        InstallState {
            lockfile_fingerprint: fingerprint(&lockfile_bytes),
            graph,
            checksums,
        }
        .save(&self.config.install_state_path(&self.root))?;

        Ok(report)
    }

    /// Re-fetches everything in verification mode and prunes cache
    /// entries the current graph no longer reaches.
    pub async fn clean_cache(&self) -> Result<Vec<PathBuf>> {
        let snapshot = InstallState::load(&self.config.install_state_path(&self.root))?
            .ok_or_else(|| KnotError::GraphInvariant {
                reason: "no install state; run an install before cleaning the cache".to_string(),
            })?;

        let cache = Arc::new(Cache::new(&self.config));
        let fetch_options = FetchOptions {
            config: self.config.clone(),
            cache: cache.clone(),
            expected_checksums: snapshot.checksums.clone(),
        };

        fetch_everything(&snapshot.graph, Arc::new(HttpFetcher::new()), &fetch_options).await?;

        cache.cleanup()
    }
}

/// Expands one workspace pattern. Supports literal paths and a single
/// trailing `/*`, which covers the layouts in the wild.
fn expand_workspace_pattern(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let Some(parent) = pattern.strip_suffix("/*") else {
        let dir = root.join(pattern);
        return Ok(if dir.is_dir() { vec![dir] } else { Vec::new() });
    };

    let parent = root.join(parent);
    if !parent.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    let entries = fs::read_dir(&parent).map_err(|source| KnotError::ReadFile {
        path: parent.clone(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| KnotError::ReadFile {
            path: parent.clone(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(MANIFEST_NAME), contents).unwrap();
    }

    fn test_config(dir: &Path) -> Arc<KnotConfig> {
        let mut config = KnotConfig::from_env();
        config.cache_dir = dir.join("cache");
        config.mirror_dir = None;
        config.enable_scripts = false;
        config.immutable_cache = false;
        Arc::new(config)
    }

    fn monorepo(dir: &Path) {
        write_manifest(
            dir,
            r#"{"name":"mono","version":"1.0.0","workspaces":["packages/*"],
                "dependencies":{"web":"workspace:*"}}"#,
        );
        write_manifest(
            &dir.join("packages/web"),
            r#"{"name":"web","version":"1.0.0","dependencies":{"lib":"workspace:*"}}"#,
        );
        write_manifest(
            &dir.join("packages/lib"),
            r#"{"name":"lib","version":"1.0.0"}"#,
        );
    }

    #[test]
    fn discovers_workspaces_from_patterns() {
        let dir = tempfile::tempdir().unwrap();
        monorepo(dir.path());

        let project = Project::open(dir.path(), test_config(dir.path())).unwrap();

        let names: Vec<_> = project
            .workspaces
            .iter()
            .map(|workspace| workspace.manifest.name.clone().unwrap())
            .collect();
        // Root first, then each pattern's matches in sorted directory
        // order, so discovery is stable across filesystems.
        assert_eq!(names, vec!["mono", "lib", "web"]);
    }

    #[test]
    fn duplicate_workspace_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"name":"mono","workspaces":["packages/*"]}"#,
        );
        write_manifest(&dir.path().join("packages/a"), r#"{"name":"dup"}"#);
        write_manifest(&dir.path().join("packages/b"), r#"{"name":"dup"}"#);

        let error = Project::open(dir.path(), test_config(dir.path())).unwrap_err();
        assert!(matches!(error, KnotError::DuplicateWorkspace { .. }));
    }

    #[test]
    fn missing_root_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = Project::open(dir.path(), test_config(dir.path())).unwrap_err();
        assert!(matches!(error, KnotError::ManifestMissing { .. }));
    }

    #[tokio::test]
    async fn workspace_only_install_runs_offline() {
        let dir = tempfile::tempdir().unwrap();
        monorepo(dir.path());

        let project = Project::open(dir.path(), test_config(dir.path())).unwrap();
        let report = project.install(&InstallOptions::default()).await.unwrap();

        // Three workspaces, zero registry packages.
        assert_eq!(report.packages, 3);
        assert_eq!(report.cache_misses, 0);
        assert!(project.lockfile_path().is_file());
        assert!(project
            .config
            .install_state_path(&project.root)
            .is_file());
    }

    #[tokio::test]
    async fn second_install_reuses_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        monorepo(dir.path());

        let project = Project::open(dir.path(), test_config(dir.path())).unwrap();
        let first = project.install(&InstallOptions::default()).await.unwrap();
        assert!(!first.from_snapshot);

        let second = project.install(&InstallOptions::default()).await.unwrap();
        assert!(second.from_snapshot);
        assert_eq!(second.packages, first.packages);
    }

    #[tokio::test]
    async fn frozen_lockfile_rejects_a_fresh_project() {
        let dir = tempfile::tempdir().unwrap();
        monorepo(dir.path());

        let project = Project::open(dir.path(), test_config(dir.path())).unwrap();
        let options = InstallOptions {
            frozen_lockfile: true,
            ..Default::default()
        };

        assert!(project.install(&options).await.is_err());
    }

    #[test]
    fn expands_literal_and_star_patterns() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("packages/a")).unwrap();
        fs::create_dir_all(dir.path().join("packages/b")).unwrap();
        fs::create_dir_all(dir.path().join("tools")).unwrap();

        let starred = expand_workspace_pattern(dir.path(), "packages/*").unwrap();
        assert_eq!(starred.len(), 2);

        let literal = expand_workspace_pattern(dir.path(), "tools").unwrap();
        assert_eq!(literal, vec![dir.path().join("tools")]);

        assert!(expand_workspace_pattern(dir.path(), "missing/*")
            .unwrap()
            .is_empty());
    }
}
