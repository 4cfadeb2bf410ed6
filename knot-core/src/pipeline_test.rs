//! End-to-end coverage of the resolve → virtualize → persist cycle,
//! driven by an in-memory resolver table instead of a registry.

use crate::ident::{Descriptor, DescriptorHash, Ident, Locator, LocatorHash, Package};
use crate::lockfile;
use crate::resolve::peers::apply_virtual_resolutions;
use crate::resolve::{resolve_everything, ResolveOptions};
use crate::resolver::{LockfileResolver, ResolveContext, Resolver, ResolverChain};
use crate::{KnotConfig, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct TableResolver {
    candidates: BTreeMap<DescriptorHash, Locator>,
    packages: BTreeMap<LocatorHash, Package>,
    resolve_calls: AtomicUsize,
}

impl TableResolver {
    fn add(&mut self, descriptor: &Descriptor, package: &Package) {
        self.candidates
            .insert(descriptor.hash().clone(), package.locator.clone());
        self.packages
            .insert(package.locator.hash().clone(), package.clone());
    }
}

#[async_trait]
impl Resolver for TableResolver {
    fn supports_descriptor(&self, descriptor: &Descriptor, _context: &ResolveContext) -> bool {
        self.candidates.contains_key(descriptor.hash())
    }

    fn supports_locator(&self, locator: &Locator, _context: &ResolveContext) -> bool {
        self.packages.contains_key(locator.hash())
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        _dependencies: &BTreeMap<DescriptorHash, Package>,
        _context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        Ok(self
            .candidates
            .get(descriptor.hash())
            .cloned()
            .into_iter()
            .collect())
    }

    async fn resolve(&self, locator: &Locator, _context: &ResolveContext) -> Result<Package> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.packages[locator.hash()].clone())
    }
}

fn package(name: &str, version: &str) -> Package {
    let locator = Locator::new(Ident::new(None, name), &format!("npm:{version}"));
    let mut package = Package::new(locator);
    package.version = Some(version.to_string());
    package
}

fn depend(parent: &mut Package, name: &str, range: &str) -> Descriptor {
    let descriptor = Descriptor::new(Ident::new(None, name), range);
    parent
        .dependencies
        .insert(descriptor.ident().hash().clone(), descriptor.clone());
    descriptor
}

fn peer(parent: &mut Package, name: &str, range: &str) {
    let descriptor = Descriptor::new(Ident::new(None, name), range);
    parent
        .peer_dependencies
        .insert(descriptor.ident().hash().clone(), descriptor);
}

/// app -> plugin (peer react), app -> react. The plugin must end up
/// virtualized against app's react.
fn sample_world() -> (TableResolver, Descriptor, Locator) {
    let mut resolver = TableResolver::default();

    let mut app = package("app", "1.0.0");
    let mut plugin = package("plugin", "2.0.0");
    let react = package("react", "18.2.0");

    let plugin_request = depend(&mut app, "plugin", "npm:^2.0.0");
    let react_request = depend(&mut app, "react", "npm:^18.0.0");
    peer(&mut plugin, "react", "^18.0.0");

    let app_request = Descriptor::new(Ident::new(None, "app"), "npm:^1.0.0");
    let app_locator = app.locator.clone();

    resolver.add(&app_request, &app);
    resolver.add(&plugin_request, &plugin);
    resolver.add(&react_request, &react);

    (resolver, app_request, app_locator)
}

fn context() -> ResolveContext {
    ResolveContext::new(Arc::new(KnotConfig::from_env()))
}

#[tokio::test]
async fn resolve_virtualize_persist_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("knot.lock");

    let (resolver, app_request, app_locator) = sample_world();
    let context = context();

    let mut graph = resolve_everything(
        &[app_request.clone()],
        &resolver,
        &context,
        &ResolveOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(graph.packages.len(), 3);

    let report = apply_virtual_resolutions(&mut graph, &[app_locator.clone()]).unwrap();
    assert!(report.warnings.is_empty());
    graph.assert_consistent().unwrap();

    // The plugin got a virtual clone whose react slot points at the
    // concrete react resolution.
    let clone = graph
        .packages
        .values()
        .find(|package| package.is_virtual())
        .expect("peer-carrying package must be cloned");
    assert_eq!(clone.locator.ident().name(), "plugin");
    assert!(clone
        .dependencies
        .contains_key(Ident::new(None, "react").hash()));

    let mut checksums = BTreeMap::new();
    let react_hash = Locator::new(Ident::new(None, "react"), "npm:18.2.0")
        .hash()
        .clone();
    checksums.insert(react_hash.clone(), "1/feedface".to_string());

    lockfile::write(&lock_path, &graph, &checksums, &BTreeSet::new()).unwrap();
    let stored = lockfile::read(&lock_path).unwrap();

    // Physical resolutions survive, virtual ones do not.
    assert_eq!(stored.packages.len(), 3);
    assert!(stored.packages.values().all(|package| !package.is_virtual()));
    assert_eq!(stored.checksums.get(&react_hash).unwrap(), "1/feedface");
}

#[tokio::test]
async fn lockfile_state_short_circuits_the_next_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = dir.path().join("knot.lock");

    let (resolver, app_request, app_locator) = sample_world();

    let mut graph = resolve_everything(
        &[app_request.clone()],
        &resolver,
        &context(),
        &ResolveOptions::default(),
    )
    .await
    .unwrap();
    apply_virtual_resolutions(&mut graph, &[app_locator]).unwrap();

    lockfile::write(&lock_path, &graph, &BTreeMap::new(), &BTreeSet::new()).unwrap();
    let stored = lockfile::read(&lock_path).unwrap();

    // Fresh resolver table so any fallthrough would be visible.
    let (fallback, app_request_again, _) = sample_world();
    let fallback = Arc::new(fallback);

    let chain = ResolverChain::new(vec![Arc::new(LockfileResolver), fallback.clone()]);
    let context = ResolveContext::new(Arc::new(KnotConfig::from_env())).with_stored(stored);

    let second = resolve_everything(
        &[app_request_again],
        &chain,
        &context,
        &ResolveOptions::default(),
    )
    .await
    .unwrap();

    // Same physical resolutions, served entirely from stored state.
    assert_eq!(fallback.resolve_calls.load(Ordering::SeqCst), 0);
    for (descriptor_hash, locator_hash) in second.resolutions.iter() {
        if !second.descriptors[descriptor_hash].is_virtual() {
            assert_eq!(graph.resolutions.get(descriptor_hash), Some(locator_hash));
        }
    }
}

#[tokio::test]
async fn resolution_and_virtualization_are_deterministic() {
    let mut serialized = Vec::new();

    for _ in 0..2 {
        let (resolver, app_request, app_locator) = sample_world();

        let mut graph = resolve_everything(
            &[app_request],
            &resolver,
            &context(),
            &ResolveOptions::default(),
        )
        .await
        .unwrap();

        apply_virtual_resolutions(&mut graph, &[app_locator]).unwrap();
        serialized.push(serde_json::to_string(&graph).unwrap());
    }

    assert_eq!(serialized[0], serialized[1]);
}
