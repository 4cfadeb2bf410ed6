use crate::config::KnotConfig;
use crate::ident::{Descriptor, DescriptorHash, Ident, IdentHash, Locator, LocatorHash, Package};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod chain;
pub mod legacy;
pub mod lockfile;
pub mod protocol;
pub mod workspace;

pub use chain::ResolverChain;
pub use legacy::import_legacy_lockfile;
pub use lockfile::LockfileResolver;
pub use protocol::ProtocolResolver;
pub use workspace::{WorkspaceHandle, WorkspaceResolver};

/// Resolutions and package data carried over from a prior run's
/// lockfile. Served verbatim by the lockfile resolver so unchanged
/// requests stay stable across runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredState {
    pub resolutions: BTreeMap<DescriptorHash, LocatorHash>,
    pub packages: BTreeMap<LocatorHash, Package>,
    pub checksums: BTreeMap<LocatorHash, String>,
}

/// An extension may only add dependencies or peer requests that the
/// resolved package does not already declare; it can never remove or
/// override existing ones.
#[derive(Clone, Debug, Default)]
pub struct PackageExtension {
    pub dependencies: Vec<Descriptor>,
    pub peer_dependencies: Vec<Descriptor>,
}

/// Shared, read-only view handed to every resolver call.
#[derive(Clone)]
pub struct ResolveContext {
    pub config: Arc<KnotConfig>,
    pub stored: Arc<StoredState>,
    pub workspaces: Arc<Vec<WorkspaceHandle>>,
    pub extensions: Arc<BTreeMap<IdentHash, PackageExtension>>,
}

impl ResolveContext {
    pub fn new(config: Arc<KnotConfig>) -> Self {
        ResolveContext {
            config,
            stored: Arc::new(StoredState::default()),
            workspaces: Arc::new(Vec::new()),
            extensions: Arc::new(BTreeMap::new()),
        }
    }

    pub fn with_stored(mut self, stored: StoredState) -> Self {
        self.stored = Arc::new(stored);
        self
    }

    pub fn with_workspaces(mut self, workspaces: Vec<WorkspaceHandle>) -> Self {
        self.workspaces = Arc::new(workspaces);
        self
    }

    pub fn with_extensions(mut self, extensions: BTreeMap<IdentHash, PackageExtension>) -> Self {
        self.extensions = Arc::new(extensions);
        self
    }

    pub fn workspace_by_ident(&self, ident: &Ident) -> Option<&WorkspaceHandle> {
        self.workspaces
            .iter()
            .find(|workspace| workspace.ident() == ident)
    }
}

/// A resolution strategy. A chain of these turns dependency requests
/// into locators, and locators into full package data.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Whether this resolver knows how to interpret the request.
    fn supports_descriptor(&self, descriptor: &Descriptor, context: &ResolveContext) -> bool;

    /// Whether this resolver knows how to hydrate the locator.
    fn supports_locator(&self, locator: &Locator, context: &ResolveContext) -> bool;

    /// Whether resolutions produced by this resolver belong in the
    /// lockfile. Workspaces, for instance, are re-discovered from the
    /// filesystem on every run and are never persisted.
    fn should_persist_resolution(&self, _locator: &Locator, _context: &ResolveContext) -> bool {
        true
    }

    /// Gives the resolver a chance to contextualize the request with
    /// its dependent, e.g. to anchor relative paths.
    fn bind_descriptor(
        &self,
        descriptor: Descriptor,
        _parent: &Locator,
        _context: &ResolveContext,
    ) -> Descriptor {
        descriptor
    }

    /// Descriptors that must be resolved before `get_candidates` can
    /// run; their resolved packages are passed back in.
    fn get_resolution_dependencies(
        &self,
        _descriptor: &Descriptor,
        _context: &ResolveContext,
    ) -> Vec<Descriptor> {
        Vec::new()
    }

    /// Candidate locators for the request, best first.
    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>>;

    /// Filters `references` down to those satisfying the request, best
    /// first, or `None` when the resolver cannot tell without a full
    /// `get_candidates` pass.
    async fn get_satisfying(
        &self,
        _descriptor: &Descriptor,
        _references: &[String],
        _context: &ResolveContext,
    ) -> Result<Option<Vec<Locator>>> {
        Ok(None)
    }

    /// Hydrates a locator into full package data. The returned package
    /// must keep the exact locator identity it was asked about.
    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package>;
}
