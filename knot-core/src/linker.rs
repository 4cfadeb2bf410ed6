use crate::cache::{Cache, CacheEvents};
use crate::config::KnotConfig;
use crate::ident::{LinkType, Locator, LocatorHash, Package};
use crate::lifecycle::BuildDirective;
use crate::resolve::ResolutionGraph;
use crate::resolver::workspace::WORKSPACE_PROTOCOL;
use crate::{KnotError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A package whose install scripts still need to run, with everything
/// the build orchestrator needs to run them.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub locator: Locator,
    pub location: PathBuf,
    pub directives: Vec<BuildDirective>,
}

pub struct LinkContext {
    pub project_root: PathBuf,
    pub config: Arc<KnotConfig>,
}

/// Seam between the resolution graph and the on-disk layout. The store
/// linker below is the default; alternative layouts implement the same
/// surface.
pub trait Linker: Send + Sync {
    fn supports_package(&self, package: &Package, context: &LinkContext) -> bool;

    /// Materializes one package and returns its install location.
    fn install_package(
        &mut self,
        package: &Package,
        archive: Option<&Path>,
        context: &LinkContext,
    ) -> Result<PathBuf>;

    /// Wires a package's dependencies into its install location once
    /// every location is known.
    fn attach_dependencies(
        &mut self,
        package: &Package,
        dependencies: &[(Package, PathBuf)],
        context: &LinkContext,
    ) -> Result<()>;

    /// Flushes any remaining work and reports the packages that still
    /// need their install scripts run.
    fn finalize_install(&mut self, context: &LinkContext) -> Result<Vec<BuildRequest>>;
}

/// Links every accessible package: installs each one, then attaches
/// dependency edges, then collects build requests. Hard packages are
/// unpacked from the cache; their archives must have been fetched
/// beforehand.
pub async fn link_everything(
    graph: &ResolutionGraph,
    linker: &mut dyn Linker,
    cache: &Cache,
    checksums: &BTreeMap<LocatorHash, String>,
    context: &LinkContext,
) -> Result<Vec<BuildRequest>> {
    let mut locations: BTreeMap<LocatorHash, PathBuf> = BTreeMap::new();

    for hash in graph.accessible.iter() {
        let package = graph.package_of(hash)?;

        if !linker.supports_package(package, context) {
            continue;
        }

        let location = if package.link_type == LinkType::Soft {
            linker.install_package(package, None, context)?
        } else {
            let physical = package.locator.devirtualize();
            let expected = checksums.get(physical.hash()).map(String::as_str);

            let mut fetched = cache
                .fetch(&physical, expected, &CacheEvents::default(), || async {
                    Err(KnotError::Archive {
                        path: PathBuf::from(physical.to_string()),
                        source: std::io::Error::other(
                            "archive missing from cache at link time",
                        ),
                    })
                })
                .await?;

            let archive_path = fetched.view.path().to_path_buf();
            let location = linker.install_package(package, Some(archive_path.as_path()), context)?;
            fetched.view.release();
            location
        };

        locations.insert(hash.clone(), location);
    }

    for hash in graph.accessible.iter() {
        let package = graph.package_of(hash)?;

        if !locations.contains_key(hash) {
            continue;
        }

        let mut dependencies = Vec::new();
        for descriptor in package.dependencies.values() {
            let resolution = graph.resolution_of(descriptor.hash())?;
            let child = graph.package_of(resolution)?;

            if let Some(location) = locations.get(resolution) {
                dependencies.push((child.clone(), location.clone()));
            }
        }

        linker.attach_dependencies(package, &dependencies, context)?;
    }

    linker.finalize_install(context)
}

/// Default layout: hard packages unpack into a content-addressed store
/// under the project, workspaces stay in place, and dependency edges
/// become symlinks in each package's `node_modules`.
pub struct StoreLinker {
    locations: BTreeMap<LocatorHash, PathBuf>,
    pending_builds: Vec<BuildRequest>,
}

impl StoreLinker {
    pub fn new() -> Self {
        StoreLinker {
            locations: BTreeMap::new(),
            pending_builds: Vec::new(),
        }
    }

    fn store_dir(context: &LinkContext) -> PathBuf {
        context.project_root.join(".knot").join("store")
    }

    fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
        let staging = dest.with_extension("staging");
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|source| KnotError::WriteFile {
                path: staging.clone(),
                source,
            })?;
        }

        let file = fs::File::open(archive).map_err(|source| KnotError::ReadFile {
            path: archive.to_path_buf(),
            source,
        })?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tarball = tar::Archive::new(decoder);

        tarball
            .unpack(&staging)
            .map_err(|source| KnotError::Archive {
                path: archive.to_path_buf(),
                source,
            })?;

        // Registry tarballs nest everything under a "package" folder.
        let inner = staging.join("package");
        let source_dir = if inner.is_dir() { inner } else { staging.clone() };

        fs::rename(&source_dir, dest).map_err(|source| KnotError::WriteFile {
            path: dest.to_path_buf(),
            source,
        })?;

        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }

        Ok(())
    }

    fn read_build_directives(location: &Path) -> Result<Vec<BuildDirective>> {
        let manifest_path = location.join("package.json");
        if !manifest_path.is_file() {
            return Ok(Vec::new());
        }

        let data = fs::read_to_string(&manifest_path).map_err(|source| KnotError::ReadFile {
            path: manifest_path.clone(),
            source,
        })?;

        let value: Value = serde_json::from_str(&data).map_err(|source| KnotError::ParseJson {
            path: manifest_path,
            source,
        })?;

        let Some(Value::Object(scripts)) = value.get("scripts") else {
            return Ok(Vec::new());
        };

        let mut directives = Vec::new();
        for key in ["preinstall", "install", "postinstall"] {
            if let Some(Value::String(script)) = scripts.get(key) {
                if !script.is_empty() {
                    directives.push(BuildDirective::Script(key.to_string()));
                }
            }
        }

        Ok(directives)
    }

    fn link_into(source: &Path, dest: &Path) -> Result<()> {
        if dest.exists() || dest.symlink_metadata().is_ok() {
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| KnotError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        make_symlink(source, dest).map_err(|source| KnotError::WriteFile {
            path: dest.to_path_buf(),
            source,
        })
    }
}

impl Default for StoreLinker {
    fn default() -> Self {
        StoreLinker::new()
    }
}

impl Linker for StoreLinker {
    fn supports_package(&self, _package: &Package, _context: &LinkContext) -> bool {
        true
    }

    fn install_package(
        &mut self,
        package: &Package,
        archive: Option<&Path>,
        context: &LinkContext,
    ) -> Result<PathBuf> {
        let location = match package.link_type {
            LinkType::Soft => {
                let relative = package
                    .locator
                    .reference()
                    .strip_prefix(WORKSPACE_PROTOCOL)
                    .unwrap_or(package.locator.reference());
                context.project_root.join(relative)
            }
            LinkType::Hard => {
                let dest = Self::store_dir(context).join(package.locator.slug());

                if !dest.is_dir() {
                    let archive = archive.ok_or_else(|| KnotError::Archive {
                        path: dest.clone(),
                        source: std::io::Error::other("hard package installed without an archive"),
                    })?;
                    Self::unpack_archive(archive, &dest)?;
                }

                dest
            }
        };

        if context.config.enable_scripts && package.link_type == LinkType::Hard {
            let directives = Self::read_build_directives(&location)?;
            if !directives.is_empty() {
                self.pending_builds.push(BuildRequest {
                    locator: package.locator.clone(),
                    location: location.clone(),
                    directives,
                });
            }
        }

        self.locations
            .insert(package.hash().clone(), location.clone());
        Ok(location)
    }

    fn attach_dependencies(
        &mut self,
        package: &Package,
        dependencies: &[(Package, PathBuf)],
        _context: &LinkContext,
    ) -> Result<()> {
        let Some(location) = self.locations.get(package.hash()).cloned() else {
            return Ok(());
        };

        let node_modules = location.join("node_modules");

        for (child, child_location) in dependencies {
            let dest = node_modules.join(child.locator.ident().to_string());
            Self::link_into(child_location, &dest)?;

            for (bin_name, bin_path) in child.bin.iter() {
                let bin_dest = node_modules.join(".bin").join(bin_name);
                Self::link_into(&child_location.join(bin_path), &bin_dest)?;
            }
        }

        Ok(())
    }

    fn finalize_install(&mut self, _context: &LinkContext) -> Result<Vec<BuildRequest>> {
        let mut builds = std::mem::take(&mut self.pending_builds);
        builds.sort_by(|a, b| a.locator.to_string().cmp(&b.locator.to_string()));
        Ok(builds)
    }
}

#[cfg(unix)]
fn make_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn make_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEvents;
    use crate::ident::{Descriptor, Ident};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn make_archive(dir: &Path, name: &str, manifest: &str) -> PathBuf {
        let path = dir.join(name);
        let file = fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (entry_name, contents) in [
            ("package/package.json", manifest),
            ("package/index.js", "module.exports = {};"),
        ] {
            let data = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, entry_name, data).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn test_context(root: &Path) -> LinkContext {
        let mut config = KnotConfig::from_env();
        config.cache_dir = root.join("cache");
        config.mirror_dir = None;
        config.enable_scripts = true;

        LinkContext {
            project_root: root.join("project"),
            config: Arc::new(config),
        }
    }

    async fn seed_cache(cache: &Cache, locator: &Locator, archive: PathBuf) {
        cache
            .fetch(locator, None, &CacheEvents::default(), move || async move {
                Ok(archive)
            })
            .await
            .unwrap()
            .view
            .release();
    }

    #[tokio::test]
    async fn links_hard_package_and_dependency_edge() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let cache = Cache::new(&context.config);

        let app = Locator::new(Ident::new(None, "app"), "npm:1.0.0");
        let dep = Locator::new(Ident::new(None, "dep"), "npm:2.0.0");

        let mut graph = ResolutionGraph::new();
        let mut app_package = Package::new(app.clone());
        let dep_package = Package::new(dep.clone());

        let descriptor = Descriptor::new(dep.ident().clone(), "npm:^2.0.0");
        app_package
            .dependencies
            .insert(dep.ident().hash().clone(), descriptor.clone());
        graph
            .descriptors
            .insert(descriptor.hash().clone(), descriptor.clone());
        graph
            .resolutions
            .insert(descriptor.hash().clone(), dep.hash().clone());

        graph.accessible.insert(app.hash().clone());
        graph.accessible.insert(dep.hash().clone());
        graph.packages.insert(app.hash().clone(), app_package);
        graph.packages.insert(dep.hash().clone(), dep_package);

        seed_cache(
            &cache,
            &app,
            make_archive(dir.path(), "app.tgz", r#"{"name":"app","version":"1.0.0"}"#),
        )
        .await;
        seed_cache(
            &cache,
            &dep,
            make_archive(dir.path(), "dep.tgz", r#"{"name":"dep","version":"2.0.0"}"#),
        )
        .await;

        let mut linker = StoreLinker::new();
        let builds = link_everything(&graph, &mut linker, &cache, &BTreeMap::new(), &context)
            .await
            .unwrap();

        assert!(builds.is_empty());

        let app_dir = context.project_root.join(".knot/store").join(app.slug());
        assert!(app_dir.join("package.json").is_file());
        assert!(app_dir.join("node_modules/dep").exists());
    }

    #[tokio::test]
    async fn install_scripts_become_build_requests() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let cache = Cache::new(&context.config);

        let native = Locator::new(Ident::new(None, "native"), "npm:1.0.0");
        let mut graph = ResolutionGraph::new();
        graph.accessible.insert(native.hash().clone());
        graph
            .packages
            .insert(native.hash().clone(), Package::new(native.clone()));

        let manifest = r#"{"name":"native","version":"1.0.0","scripts":{"install":"true","postinstall":"true"}}"#;
        seed_cache(&cache, &native, make_archive(dir.path(), "native.tgz", manifest)).await;

        let mut linker = StoreLinker::new();
        let builds = link_everything(&graph, &mut linker, &cache, &BTreeMap::new(), &context)
            .await
            .unwrap();

        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].locator, native);
        assert_eq!(
            builds[0].directives,
            vec![
                BuildDirective::Script("install".to_string()),
                BuildDirective::Script("postinstall".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn workspaces_link_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let cache = Cache::new(&context.config);

        let workspace_dir = context.project_root.join("packages/web");
        fs::create_dir_all(&workspace_dir).unwrap();

        let locator = Locator::new(Ident::new(None, "web"), "workspace:packages/web");
        let mut package = Package::new(locator.clone());
        package.link_type = LinkType::Soft;

        let mut graph = ResolutionGraph::new();
        graph.accessible.insert(locator.hash().clone());
        graph.packages.insert(locator.hash().clone(), package);

        let mut linker = StoreLinker::new();
        link_everything(&graph, &mut linker, &cache, &BTreeMap::new(), &context)
            .await
            .unwrap();

        assert_eq!(
            linker.locations.get(locator.hash()),
            Some(&workspace_dir)
        );
    }
}
