use crate::ident::{
    Descriptor, DescriptorHash, Ident, IdentHash, LinkType, Locator, Package,
};
use crate::resolver::{ResolveContext, Resolver};
use crate::{KnotError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub const WORKSPACE_PROTOCOL: &str = "workspace:";

/// The slice of a workspace the resolver needs: its identity, declared
/// version, project-relative path, and manifest dependency maps.
#[derive(Clone, Debug)]
pub struct WorkspaceHandle {
    ident: Ident,
    version: Option<String>,
    relative_path: String,
    anchored_locator: Locator,
    pub dependencies: BTreeMap<IdentHash, Descriptor>,
    pub peer_dependencies: BTreeMap<IdentHash, Descriptor>,
}

impl WorkspaceHandle {
    pub fn new(ident: Ident, version: Option<String>, relative_path: &str) -> Self {
        let anchored_locator = Locator::new(
            ident.clone(),
            &format!("{WORKSPACE_PROTOCOL}{relative_path}"),
        );

        WorkspaceHandle {
            ident,
            version,
            relative_path: relative_path.to_string(),
            anchored_locator,
            dependencies: BTreeMap::new(),
            peer_dependencies: BTreeMap::new(),
        }
    }

    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn anchored_locator(&self) -> &Locator {
        &self.anchored_locator
    }

    pub fn anchored_descriptor(&self) -> Descriptor {
        self.anchored_locator.as_descriptor()
    }

    /// Whether this workspace satisfies the requested range: `*`, an
    /// exact relative-path pointer, or a semver range matched by the
    /// workspace's own declared version.
    pub fn accepts(&self, range: &str) -> bool {
        let target = range.strip_prefix(WORKSPACE_PROTOCOL).unwrap_or(range);

        if target == "*" {
            return true;
        }

        if target == self.relative_path {
            return true;
        }

        let Some(version) = self.version.as_deref() else {
            return false;
        };

        let Ok(parsed) = knot_semver::Version::parse(version) else {
            return false;
        };

        match knot_semver::RangeSet::parse(target) {
            Ok(set) => set.matches(&parsed),
            Err(_) => false,
        }
    }
}

/// Resolves requests that point at locally-developed packages. Never
/// persisted: workspaces are re-discovered from the filesystem on
/// every run.
pub struct WorkspaceResolver;

impl WorkspaceResolver {
    fn matching<'a>(
        descriptor: &Descriptor,
        context: &'a ResolveContext,
    ) -> Option<&'a WorkspaceHandle> {
        context
            .workspace_by_ident(descriptor.ident())
            .filter(|workspace| workspace.accepts(descriptor.range()))
    }
}

#[async_trait]
impl Resolver for WorkspaceResolver {
    fn supports_descriptor(&self, descriptor: &Descriptor, context: &ResolveContext) -> bool {
        if descriptor.range().starts_with(WORKSPACE_PROTOCOL) {
            return true;
        }

        Self::matching(descriptor, context).is_some()
    }

    fn supports_locator(&self, locator: &Locator, _context: &ResolveContext) -> bool {
        locator.reference().starts_with(WORKSPACE_PROTOCOL)
    }

    fn should_persist_resolution(&self, _locator: &Locator, _context: &ResolveContext) -> bool {
        false
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        _dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        match Self::matching(descriptor, context) {
            Some(workspace) => Ok(vec![workspace.anchored_locator().clone()]),
            None => Err(KnotError::NoCandidates {
                descriptor: descriptor.to_string(),
            }),
        }
    }

    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package> {
        let workspace = context
            .workspaces
            .iter()
            .find(|workspace| workspace.anchored_locator() == locator)
            .ok_or_else(|| KnotError::GraphInvariant {
                reason: format!("no workspace registered for {locator}"),
            })?;

        let mut package = Package::new(locator.clone());
        package.version = workspace.version().map(|version| version.to_string());
        package.link_type = LinkType::Soft;
        package.dependencies = workspace.dependencies.clone();
        package.peer_dependencies = workspace.peer_dependencies.clone();

        Ok(package)
    }
}
