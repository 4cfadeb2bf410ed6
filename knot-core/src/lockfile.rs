use crate::cache::CACHE_VERSION;
use crate::ident::{Descriptor, Ident, LinkType, Locator, LocatorHash, Package};
use crate::resolve::ResolutionGraph;
use crate::resolver::StoredState;
use crate::{KnotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const LOCKFILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    pub version: u32,
    pub cache_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockEntry {
    pub resolution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub language_name: String,
    pub link_type: LinkType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bin: BTreeMap<String, PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// On-disk lockfile: a `__metadata` header plus one entry per resolved
/// package, keyed by the comma-joined sorted list of every request
/// that resolved to it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(rename = "__metadata")]
    pub metadata: LockMetadata,
    #[serde(flatten)]
    pub entries: BTreeMap<String, LockEntry>,
}

fn entry_from_package(package: &Package, checksum: Option<&String>) -> LockEntry {
    // Virtualization rewrites dependency slots to point at context
    // clones; the persisted form always carries the original request so
    // replay never schedules a virtual descriptor.
    let dependencies = package
        .dependencies
        .values()
        .map(|descriptor| {
            let descriptor = descriptor.devirtualize();
            (
                descriptor.ident().to_string(),
                descriptor.range().to_string(),
            )
        })
        .collect();

    let peer_dependencies = package
        .peer_dependencies
        .values()
        .map(|descriptor| {
            let descriptor = descriptor.devirtualize();
            (
                descriptor.ident().to_string(),
                descriptor.range().to_string(),
            )
        })
        .collect();

    LockEntry {
        resolution: package.locator.to_string(),
        version: package.version.clone(),
        language_name: package.language_name.clone(),
        link_type: package.link_type,
        dependencies,
        peer_dependencies,
        bin: package.bin.clone(),
        checksum: checksum.cloned(),
    }
}

/// Writes the persistable part of the graph: virtual clones and
/// explicitly excluded resolutions (e.g. workspaces resolved from
/// disk) are left out, since both are recomputed on every install.
pub fn write(
    path: &Path,
    graph: &ResolutionGraph,
    checksums: &BTreeMap<LocatorHash, String>,
    excluded: &BTreeSet<LocatorHash>,
) -> Result<()> {
    let mut requests: BTreeMap<LocatorHash, BTreeSet<String>> = BTreeMap::new();

    for (descriptor_hash, locator_hash) in graph.resolutions.iter() {
        let Some(descriptor) = graph.descriptors.get(descriptor_hash) else {
            continue;
        };

        if descriptor.is_virtual() || excluded.contains(locator_hash) {
            continue;
        }

        let Some(package) = graph.packages.get(locator_hash) else {
            continue;
        };

        if package.is_virtual() {
            continue;
        }

        requests
            .entry(locator_hash.clone())
            .or_default()
            .insert(descriptor.to_string());
    }

    let mut entries = BTreeMap::new();

    for (locator_hash, descriptors) in requests {
        let package = graph.package_of(&locator_hash)?;
        let key = descriptors.into_iter().collect::<Vec<_>>().join(", ");
        entries.insert(key, entry_from_package(package, checksums.get(&locator_hash)));
    }

    let lockfile = Lockfile {
        metadata: LockMetadata {
            version: LOCKFILE_VERSION,
            cache_key: CACHE_VERSION.to_string(),
        },
        entries,
    };

    let data = serde_yaml::to_string(&lockfile).map_err(|source| KnotError::LockfileWrite {
        path: path.to_path_buf(),
        source,
    })?;

    fs::write(path, data).map_err(|source| KnotError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a lockfile back into resolver-consumable state. A missing
/// file is an empty state, not an error.
pub fn read(path: &Path) -> Result<StoredState> {
    if !path.is_file() {
        return Ok(StoredState::default());
    }

    let data = fs::read_to_string(path).map_err(|source| KnotError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let lockfile: Lockfile =
        serde_yaml::from_str(&data).map_err(|source| KnotError::LockfileRead {
            path: path.to_path_buf(),
            source,
        })?;

    if lockfile.metadata.version > LOCKFILE_VERSION {
        return Err(KnotError::ManifestInvalid {
            path: path.to_path_buf(),
            reason: format!(
                "lockfile version {} is newer than supported version {LOCKFILE_VERSION}",
                lockfile.metadata.version
            ),
        });
    }

    let mut stored = StoredState::default();

    for (key, entry) in lockfile.entries.iter() {
        let locator = Locator::parse(&entry.resolution)?;

        let mut package = Package::new(locator.clone());
        package.version = entry.version.clone();
        package.language_name = entry.language_name.clone();
        package.link_type = entry.link_type;
        package.bin = entry.bin.clone();

        for (ident, range) in entry.dependencies.iter() {
            let descriptor = Descriptor::new(Ident::parse(ident)?, range);
            package
                .dependencies
                .insert(descriptor.ident().hash().clone(), descriptor);
        }

        for (ident, range) in entry.peer_dependencies.iter() {
            let descriptor = Descriptor::new(Ident::parse(ident)?, range);
            package
                .peer_dependencies
                .insert(descriptor.ident().hash().clone(), descriptor);
        }

        if let Some(checksum) = &entry.checksum {
            stored
                .checksums
                .insert(locator.hash().clone(), checksum.clone());
        }

        for request in key.split(", ") {
            let descriptor = Descriptor::parse(request)?;
            stored
                .resolutions
                .insert(descriptor.hash().clone(), locator.hash().clone());
        }

        stored.packages.insert(locator.hash().clone(), package);
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> (ResolutionGraph, Locator, BTreeMap<LocatorHash, String>) {
        let mut graph = ResolutionGraph::new();

        let lodash = Locator::new(Ident::new(None, "lodash"), "npm:4.17.21");
        let mut package = Package::new(lodash.clone());
        package.version = Some("4.17.21".to_string());

        // Two distinct requests landing on the same resolution.
        for range in ["npm:^4.0.0", "npm:^4.17.0"] {
            let descriptor = Descriptor::new(lodash.ident().clone(), range);
            graph
                .descriptors
                .insert(descriptor.hash().clone(), descriptor.clone());
            graph
                .resolutions
                .insert(descriptor.hash().clone(), lodash.hash().clone());
        }

        graph.packages.insert(lodash.hash().clone(), package);

        let mut checksums = BTreeMap::new();
        checksums.insert(lodash.hash().clone(), format!("{CACHE_VERSION}/abc123"));

        (graph, lodash, checksums)
    }

    #[test]
    fn roundtrip_preserves_resolutions_and_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knot.lock");

        let (graph, lodash, checksums) = sample_graph();

        write(&path, &graph, &checksums, &BTreeSet::new()).unwrap();
        let stored = read(&path).unwrap();

        assert_eq!(stored.packages.len(), 1);
        assert_eq!(stored.resolutions.len(), 2);
        assert_eq!(
            stored.checksums.get(lodash.hash()),
            checksums.get(lodash.hash())
        );

        let package = &stored.packages[lodash.hash()];
        assert_eq!(package.version.as_deref(), Some("4.17.21"));

        // Shared resolutions collapse into one multi-key entry.
        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("lodash@npm:^4.0.0, lodash@npm:^4.17.0"));
        assert!(data.contains("__metadata"));
    }

    #[test]
    fn virtual_entries_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knot.lock");

        let (mut graph, lodash, checksums) = sample_graph();

        let virtual_descriptor =
            Descriptor::new(lodash.ident().clone(), "npm:^4.0.0").virtualize("entropy");
        let virtual_package = graph.packages[lodash.hash()].virtualize("entropy");
        graph
            .resolutions
            .insert(virtual_descriptor.hash().clone(), virtual_package.hash().clone());
        graph
            .packages
            .insert(virtual_package.hash().clone(), virtual_package);
        graph
            .descriptors
            .insert(virtual_descriptor.hash().clone(), virtual_descriptor);

        write(&path, &graph, &checksums, &BTreeSet::new()).unwrap();
        let data = fs::read_to_string(&path).unwrap();
        assert!(!data.contains("virtual:"));
    }

    /// Peer wiring repoints a dependent's dependency slot at the
    /// context clone; the persisted entry must carry the original
    /// request, or replay would schedule a descriptor no resolver
    /// supports.
    #[test]
    fn virtualized_dependency_slots_are_persisted_devirtualized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knot.lock");

        let (mut graph, lodash, checksums) = sample_graph();

        let app = Locator::new(Ident::new(None, "app"), "npm:1.0.0");
        let mut package = Package::new(app.clone());
        let wired = Descriptor::new(lodash.ident().clone(), "npm:^4.0.0").virtualize("entropy");
        package
            .dependencies
            .insert(wired.ident().hash().clone(), wired);

        let request = app.as_descriptor();
        graph
            .descriptors
            .insert(request.hash().clone(), request.clone());
        graph
            .resolutions
            .insert(request.hash().clone(), app.hash().clone());
        graph.packages.insert(app.hash().clone(), package);

        write(&path, &graph, &checksums, &BTreeSet::new()).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        assert!(!data.contains("virtual:"));

        let stored = read(&path).unwrap();
        let replayed = &stored.packages[app.hash()];
        let dependency = replayed.dependencies.values().next().unwrap();
        assert_eq!(dependency.range(), "npm:^4.0.0");
    }

    #[test]
    fn excluded_resolutions_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knot.lock");

        let (graph, lodash, checksums) = sample_graph();

        let mut excluded = BTreeSet::new();
        excluded.insert(lodash.hash().clone());

        write(&path, &graph, &checksums, &excluded).unwrap();
        let stored = read(&path).unwrap();
        assert!(stored.packages.is_empty());
    }

    #[test]
    fn missing_lockfile_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let stored = read(&dir.path().join("absent.lock")).unwrap();
        assert!(stored.resolutions.is_empty());
    }

    #[test]
    fn future_lockfile_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knot.lock");

        fs::write(
            &path,
            format!(
                "__metadata:\n  version: {}\n  cache_key: \"9\"\n",
                LOCKFILE_VERSION + 1
            ),
        )
        .unwrap();

        assert!(read(&path).is_err());
    }
}
