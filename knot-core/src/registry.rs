use crate::config::KnotConfig;
use crate::fetcher::Fetcher;
use crate::ident::{Descriptor, DescriptorHash, Ident, Locator, Package};
use crate::resolver::{ResolveContext, Resolver};
use crate::{KnotError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const NPM_PROTOCOL: &str = "npm:";

#[derive(Debug, Deserialize)]
pub struct RegistryMetadata {
    pub versions: BTreeMap<String, RegistryVersion>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryVersion {
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "peerDependenciesMeta")]
    pub peer_dependencies_meta: BTreeMap<String, RegistryPeerMeta>,
    #[serde(default)]
    pub bin: Option<serde_json::Value>,
    pub dist: RegistryDist,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistryPeerMeta {
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryDist {
    pub tarball: String,
    #[serde(default)]
    pub integrity: Option<String>,
}

fn encode_package_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

fn metadata_url(registry: &str, ident: &Ident) -> String {
    format!(
        "{}/{}",
        registry.trim_end_matches('/'),
        encode_package_name(&ident.to_string())
    )
}

/// Picks the version a request selects from package metadata: an exact
/// dist-tag wins, otherwise the highest version satisfying the range.
fn pick_version(metadata: &RegistryMetadata, range: &str) -> Result<Option<String>> {
    if let Some(tagged) = metadata.dist_tags.get(range) {
        return Ok(Some(tagged.clone()));
    }

    let set = knot_semver::RangeSet::parse(range).map_err(|source| KnotError::Semver {
        value: range.to_string(),
        source,
    })?;

    Ok(set
        .max_satisfying(metadata.versions.keys().map(String::as_str))
        .map(|version| version.to_string()))
}

/// npm `bin` is either a single path (named after the package) or a
/// map of names to paths.
fn parse_bin(ident: &Ident, bin: &Option<serde_json::Value>) -> BTreeMap<String, PathBuf> {
    let mut parsed = BTreeMap::new();

    match bin {
        Some(serde_json::Value::String(path)) => {
            parsed.insert(ident.name().to_string(), PathBuf::from(path));
        }
        Some(serde_json::Value::Object(map)) => {
            for (name, path) in map {
                if let serde_json::Value::String(path) = path {
                    parsed.insert(name.clone(), PathBuf::from(path));
                }
            }
        }
        _ => {}
    }

    parsed
}

fn package_from_metadata(locator: &Locator, version: &RegistryVersion) -> Result<Package> {
    let mut package = Package::new(locator.clone());
    package.version = Some(version.version.clone());
    package.bin = parse_bin(locator.ident(), &version.bin);

    for (name, range) in version.dependencies.iter() {
        let descriptor = Descriptor::new(Ident::parse(name)?, range);
        package
            .dependencies
            .insert(descriptor.ident().hash().clone(), descriptor);
    }

    for (name, range) in version.optional_dependencies.iter() {
        let descriptor = Descriptor::new(Ident::parse(name)?, range);
        package
            .dependencies_meta
            .insert(name.clone(), crate::ident::DependencyMeta { optional: true });
        package
            .dependencies
            .insert(descriptor.ident().hash().clone(), descriptor);
    }

    for (name, range) in version.peer_dependencies.iter() {
        let descriptor = Descriptor::new(Ident::parse(name)?, range);
        package
            .peer_dependencies
            .insert(descriptor.ident().hash().clone(), descriptor);
    }

    for (name, meta) in version.peer_dependencies_meta.iter() {
        package.peer_dependencies_meta.insert(
            name.clone(),
            crate::ident::PeerDependencyMeta {
                optional: meta.optional,
            },
        );
    }

    Ok(package)
}

/// Resolves `npm:` requests against the configured registry, with one
/// metadata fetch per package name per run.
pub struct RegistryResolver {
    client: reqwest::Client,
    metadata: Mutex<BTreeMap<String, Arc<RegistryMetadata>>>,
}

impl RegistryResolver {
    pub fn new() -> Self {
        RegistryResolver {
            client: reqwest::Client::new(),
            metadata: Mutex::new(BTreeMap::new()),
        }
    }

    async fn metadata_for(
        &self,
        ident: &Ident,
        context: &ResolveContext,
    ) -> Result<Arc<RegistryMetadata>> {
        let key = ident.to_string();

        {
            let cached = self.metadata.lock().await;
            if let Some(metadata) = cached.get(&key) {
                return Ok(metadata.clone());
            }
        }

        let url = metadata_url(&context.config.registry_url, ident);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| KnotError::Http {
                url: url.clone(),
                source,
            })?;

        let metadata: RegistryMetadata =
            response.json().await.map_err(|source| KnotError::Http {
                url: url.clone(),
                source,
            })?;

        let metadata = Arc::new(metadata);
        self.metadata
            .lock()
            .await
            .insert(key, metadata.clone());
        Ok(metadata)
    }
}

impl Default for RegistryResolver {
    fn default() -> Self {
        RegistryResolver::new()
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    fn supports_descriptor(&self, descriptor: &Descriptor, _context: &ResolveContext) -> bool {
        descriptor.range().starts_with(NPM_PROTOCOL)
    }

    fn supports_locator(&self, locator: &Locator, _context: &ResolveContext) -> bool {
        locator.reference().starts_with(NPM_PROTOCOL)
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        _dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        let range = descriptor
            .range()
            .strip_prefix(NPM_PROTOCOL)
            .unwrap_or(descriptor.range());

        let metadata = self.metadata_for(descriptor.ident(), context).await?;

        let Some(version) = pick_version(&metadata, range)? else {
            return Ok(Vec::new());
        };

        Ok(vec![Locator::new(
            descriptor.ident().clone(),
            &format!("{NPM_PROTOCOL}{version}"),
        )])
    }

    async fn get_satisfying(
        &self,
        descriptor: &Descriptor,
        references: &[String],
        _context: &ResolveContext,
    ) -> Result<Option<Vec<Locator>>> {
        let range = descriptor
            .range()
            .strip_prefix(NPM_PROTOCOL)
            .unwrap_or(descriptor.range());

        let Ok(set) = knot_semver::RangeSet::parse(range) else {
            return Ok(None);
        };

        let mut satisfying: Vec<(knot_semver::Version, Locator)> = references
            .iter()
            .filter_map(|reference| {
                let version = reference.strip_prefix(NPM_PROTOCOL)?;
                let parsed = knot_semver::Version::parse(version).ok()?;
                set.matches(&parsed).then(|| {
                    (
                        parsed,
                        Locator::new(descriptor.ident().clone(), reference),
                    )
                })
            })
            .collect();

        satisfying.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(Some(
            satisfying.into_iter().map(|(_, locator)| locator).collect(),
        ))
    }

    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package> {
        let version = locator
            .reference()
            .strip_prefix(NPM_PROTOCOL)
            .unwrap_or(locator.reference());

        let metadata = self.metadata_for(locator.ident(), context).await?;

        let entry = metadata
            .versions
            .get(version)
            .ok_or_else(|| KnotError::NoCandidates {
                descriptor: locator.to_string(),
            })?;

        package_from_metadata(locator, entry)
    }
}

/// Downloads registry tarballs into temporary files the cache then
/// takes ownership of.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
        }
    }

    fn tarball_url(registry: &str, locator: &Locator) -> String {
        let ident = locator.ident();
        let version = locator
            .reference()
            .strip_prefix(NPM_PROTOCOL)
            .unwrap_or(locator.reference());

        format!(
            "{}/{}/-/{}-{}.tgz",
            registry.trim_end_matches('/'),
            encode_package_name(&ident.to_string()),
            ident.name(),
            version
        )
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        HttpFetcher::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn supports_locator(&self, locator: &Locator) -> bool {
        locator.reference().starts_with(NPM_PROTOCOL)
    }

    async fn fetch(&self, locator: &Locator, config: &KnotConfig) -> Result<PathBuf> {
        let url = Self::tarball_url(&config.registry_url, locator);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| KnotError::Http {
                url: url.clone(),
                source,
            })?;

        let bytes = response.bytes().await.map_err(|source| KnotError::Http {
            url: url.clone(),
            source,
        })?;

        let mut file = tempfile::NamedTempFile::new().map_err(|source| KnotError::WriteFile {
            path: std::env::temp_dir(),
            source,
        })?;

        file.write_all(&bytes).map_err(|source| KnotError::WriteFile {
            path: file.path().to_path_buf(),
            source,
        })?;

        let (_, path) = file.keep().map_err(|error| KnotError::WriteFile {
            path: error.file.path().to_path_buf(),
            source: error.error,
        })?;

        Ok(path)
    }
}
